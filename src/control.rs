//! The controls library: mechanisms that mitigate risks. Controls have no workflow.
use crate::store::Record;
use crate::types::{Id, TimeStamp};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ControlType {
    #[default]
    #[n(0)]
    Preventive,
    #[n(1)]
    Detective,
    #[n(2)]
    Corrective,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ControlNature {
    #[default]
    #[n(0)]
    Manual,
    #[n(1)]
    Automated,
    #[n(2)]
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ControlFrequency {
    #[n(0)]
    Continuous,
    #[n(1)]
    Daily,
    #[n(2)]
    Weekly,
    #[n(3)]
    Monthly,
    #[n(4)]
    Quarterly,
    #[n(5)]
    Annually,
    #[n(6)]
    AdHoc,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Control {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub title: String,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub reference_doc: String,
    #[n(4)]
    pub control_type: ControlType,
    #[n(5)]
    pub control_nature: ControlNature,
    #[n(6)]
    pub control_frequency: ControlFrequency,
    #[n(7)]
    pub effectiveness: Option<u8>,
    #[n(8)]
    pub is_active: bool,
    #[n(9)]
    pub business_unit_id: Id,
    #[n(10)]
    pub business_process_id: Option<Id>,
    #[n(11)]
    pub owner_id: Id,
    #[n(12)]
    pub created_by: Id,
    #[n(13)]
    pub created_at: TimeStamp,
    #[n(14)]
    pub updated_at: TimeStamp,
}

impl Record for Control {
    const ENTITY: &'static str = "control";
    const TREE: &'static str = "controls";

    fn id(&self) -> Id {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewControl {
    pub title: String,
    pub description: String,
    pub reference_doc: String,
    pub control_type: ControlType,
    pub control_nature: ControlNature,
    pub control_frequency: ControlFrequency,
    pub effectiveness: Option<u8>,
    pub business_unit_id: Id,
    pub business_process_id: Option<Id>,
    pub owner_id: Id,
}

impl NewControl {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        frequency: ControlFrequency,
        business_unit_id: Id,
        owner_id: Id,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            reference_doc: String::new(),
            control_type: ControlType::default(),
            control_nature: ControlNature::default(),
            control_frequency: frequency,
            effectiveness: None,
            business_unit_id,
            business_process_id: None,
            owner_id,
        }
    }

    pub fn rated(mut self, effectiveness: u8) -> Self {
        self.effectiveness = Some(effectiveness);
        self
    }

    pub(crate) fn into_control(self, id: Id, created_by: Id, now: TimeStamp) -> Control {
        Control {
            id,
            title: self.title.trim().to_string(),
            description: self.description.trim().to_string(),
            reference_doc: self.reference_doc,
            control_type: self.control_type,
            control_nature: self.control_nature,
            control_frequency: self.control_frequency,
            effectiveness: self.effectiveness,
            is_active: true,
            business_unit_id: self.business_unit_id,
            business_process_id: self.business_process_id,
            owner_id: self.owner_id,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub reference_doc: Option<String>,
    pub control_type: Option<ControlType>,
    pub control_nature: Option<ControlNature>,
    pub control_frequency: Option<ControlFrequency>,
    pub effectiveness: Option<Option<u8>>,
    pub is_active: Option<bool>,
    pub business_unit_id: Option<Id>,
    pub business_process_id: Option<Option<Id>>,
    pub owner_id: Option<Id>,
}

impl ControlPatch {
    pub fn deactivate() -> Self {
        Self {
            is_active: Some(false),
            ..Default::default()
        }
    }

    pub(crate) fn apply(&self, control: &mut Control) {
        let p = self.clone();
        if let Some(title) = p.title {
            control.title = title.trim().to_string();
        }
        if let Some(description) = p.description {
            control.description = description.trim().to_string();
        }
        if let Some(reference_doc) = p.reference_doc {
            control.reference_doc = reference_doc;
        }
        if let Some(control_type) = p.control_type {
            control.control_type = control_type;
        }
        if let Some(control_nature) = p.control_nature {
            control.control_nature = control_nature;
        }
        if let Some(frequency) = p.control_frequency {
            control.control_frequency = frequency;
        }
        if let Some(effectiveness) = p.effectiveness {
            control.effectiveness = effectiveness;
        }
        if let Some(is_active) = p.is_active {
            control.is_active = is_active;
        }
        if let Some(business_unit_id) = p.business_unit_id {
            control.business_unit_id = business_unit_id;
        }
        if let Some(business_process_id) = p.business_process_id {
            control.business_process_id = business_process_id;
        }
        if let Some(owner_id) = p.owner_id {
            control.owner_id = owner_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_controls_start_active_with_defaults() {
        let control = NewControl::new(
            " Dual approval ",
            "Two signatures on wires",
            ControlFrequency::Daily,
            10,
            3,
        )
        .rated(4)
        .into_control(7, 2, TimeStamp::now());

        assert!(control.is_active);
        assert_eq!(control.title, "Dual approval");
        assert_eq!(control.control_type, ControlType::Preventive);
        assert_eq!(control.control_nature, ControlNature::Manual);
        assert_eq!(control.effectiveness, Some(4));
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut control = NewControl::new(
            "Reconciliation",
            "Daily ledger match",
            ControlFrequency::Daily,
            10,
            3,
        )
        .into_control(7, 2, TimeStamp::now());
        ControlPatch::deactivate().apply(&mut control);

        assert!(!control.is_active);
        assert_eq!(control.title, "Reconciliation");
        assert_eq!(control.control_frequency, ControlFrequency::Daily);
    }
}
