//! Priority-ordered predicate rules that route incoming incidents.
//!
//! A predicate is a JSON object whose present keys must all hold:
//!
//! * `min_amount`: inclusive lower bound on the gross loss (a missing loss counts as zero)
//! * `basel_event_type_id`, `simplified_event_type_id`, `business_unit_id`: exact match
//!
//! A value that cannot be read as the expected type makes the rule miss. Evaluation never fails.
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::incident::Incident;
use crate::store::{Record, Store};
use crate::types::{Id, Role};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate(Map<String, Value>);

impl Predicate {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Only JSON objects are accepted.
    pub fn from_json(raw: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(Error::validation(format!(
                "routing predicate must be a JSON object, got {other}"
            ))),
            Err(e) => Err(Error::validation(format!("invalid routing predicate: {e}"))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn matches(&self, incident: &Incident) -> bool {
        if let Some(bound) = self.get("min_amount") {
            let Some(bound) = as_decimal(bound) else {
                return false;
            };
            let amount = incident
                .gross_loss_amount
                .map(|m| m.amount())
                .unwrap_or(Decimal::ZERO);
            if amount < bound {
                return false;
            }
        }

        let exact = [
            ("basel_event_type_id", incident.basel_event_type_id),
            ("simplified_event_type_id", incident.simplified_event_type_id),
            ("business_unit_id", incident.business_unit_id),
        ];
        exact.into_iter().all(|(key, actual)| match self.get(key) {
            None => true,
            Some(expected) => match (as_integer(expected), actual) {
                (Some(expected), Some(actual)) => i64::try_from(actual).ok() == Some(expected),
                _ => false,
            },
        })
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

// newtype wrapper because serde_json values don't implement minicbor traits.
impl<C> minicbor::Encode<C> for Predicate {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> std::result::Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.to_string())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Predicate {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        _: &mut C,
    ) -> std::result::Result<Self, minicbor::decode::Error> {
        let raw = d.str()?;
        Predicate::from_json(raw)
            .map_err(|_| minicbor::decode::Error::message("routing predicate is not a JSON object"))
    }
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

// Floats truncate toward zero; strings must hold an integer literal.
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct RoutingRule {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub predicate: Predicate,
    #[n(2)]
    pub priority: i64,
    #[n(3)]
    pub route_to_role: Option<Role>,
    #[n(4)]
    pub route_to_bu: Option<Id>,
    #[n(5)]
    pub description: Option<String>,
    #[n(6)]
    pub active: bool,
}

impl Record for RoutingRule {
    const ENTITY: &'static str = "routing rule";
    const TREE: &'static str = "routing_rules";

    fn id(&self) -> Id {
        self.id
    }
}

impl RoutingRule {
    pub fn new(id: Id, priority: i64, predicate: Predicate) -> Self {
        Self {
            id,
            predicate,
            priority,
            route_to_role: None,
            route_to_bu: None,
            description: None,
            active: true,
        }
    }

    pub fn to_role(mut self, role: Role) -> Self {
        self.route_to_role = Some(role);
        self
    }

    pub fn to_business_unit(mut self, business_unit_id: Id) -> Self {
        self.route_to_bu = Some(business_unit_id);
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingMatch {
    pub rule_id: Id,
    pub route_to_role: Option<Role>,
    pub route_to_bu: Option<Id>,
}

/// First active rule, by ascending `(priority, id)`, whose predicate holds for `incident`.
pub fn evaluate(incident: &Incident, rules: &[RoutingRule]) -> Option<RoutingMatch> {
    let mut ordered: Vec<&RoutingRule> = rules.iter().filter(|rule| rule.active).collect();
    ordered.sort_by_key(|rule| (rule.priority, rule.id));

    let found = ordered
        .into_iter()
        .find(|rule| rule.predicate.matches(incident))
        .map(|rule| RoutingMatch {
            rule_id: rule.id,
            route_to_role: rule.route_to_role,
            route_to_bu: rule.route_to_bu,
        });

    if found.is_none() {
        debug!(incident = incident.id, "no routing rule matched");
    }
    found
}

impl Store {
    pub fn routing_rules(&self) -> Result<Vec<RoutingRule>> {
        self.all()
    }

    /// Evaluates the stored rules against `incident`.
    pub fn route(&self, incident: &Incident) -> Result<Option<RoutingMatch>> {
        Ok(evaluate(incident, &self.routing_rules()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::NewIncident;
    use crate::types::{Money, TimeStamp};

    fn incident(amount: Option<&str>, basel: Option<Id>, bu: Option<Id>) -> Incident {
        let now = TimeStamp::now();
        let mut incident = NewIncident::new("Card fraud", "Skimming at branch")
            .into_incident(1, 1, now, now.due_in(7).unwrap());
        incident.gross_loss_amount = amount.map(|a| a.parse::<Money>().unwrap());
        incident.basel_event_type_id = basel;
        incident.business_unit_id = bu;
        incident
    }

    fn rule(id: Id, priority: i64, predicate: &str) -> RoutingRule {
        RoutingRule::new(id, priority, Predicate::from_json(predicate).unwrap())
    }

    fn fixture() -> Vec<RoutingRule> {
        vec![
            rule(4, 100, r#"{"business_unit_id": 2}"#).to_role(Role::Manager),
            rule(2, 10, r#"{"basel_event_type_id": 3, "business_unit_id": 2}"#)
                .to_role(Role::GroupOrm),
            rule(1, 5, r#"{"min_amount": "10000"}"#).to_role(Role::RiskOfficer),
            rule(3, 15, r#"{"basel_event_type_id": 3}"#).to_role(Role::RiskOfficer),
        ]
    }

    #[test]
    fn amount_rule_wins_on_priority() {
        let hit = evaluate(&incident(Some("25000"), Some(3), Some(2)), &fixture()).unwrap();
        assert_eq!(hit.rule_id, 1);
        assert_eq!(hit.route_to_role, Some(Role::RiskOfficer));
    }

    #[test]
    fn falls_through_to_lower_priorities() {
        let rules = fixture();
        assert_eq!(evaluate(&incident(Some("50"), Some(3), Some(2)), &rules).unwrap().rule_id, 2);
        assert_eq!(evaluate(&incident(Some("50"), Some(3), Some(9)), &rules).unwrap().rule_id, 3);
        assert_eq!(evaluate(&incident(Some("50"), Some(8), Some(2)), &rules).unwrap().rule_id, 4);
        assert_eq!(evaluate(&incident(Some("50"), Some(8), Some(9)), &rules), None);
    }

    #[test]
    fn missing_amount_counts_as_zero() {
        let rules = fixture();
        let hit = evaluate(&incident(None, Some(3), None), &rules).unwrap();
        assert_eq!(hit.rule_id, 3);

        let zero_floor = vec![rule(1, 1, r#"{"min_amount": 0}"#)];
        assert!(evaluate(&incident(None, None, None), &zero_floor).is_some());
    }

    #[test]
    fn missing_incident_field_never_matches_an_id_key() {
        let rules = vec![rule(1, 1, r#"{"business_unit_id": 2}"#)];
        assert_eq!(evaluate(&incident(None, None, None), &rules), None);
    }

    #[test]
    fn garbage_predicate_values_miss_quietly() {
        let rules = vec![
            rule(1, 1, r#"{"min_amount": "lots"}"#),
            rule(2, 2, r#"{"business_unit_id": "two"}"#),
            rule(3, 3, r#"{"business_unit_id": true}"#),
            rule(4, 4, r#"{"min_amount": null}"#),
            rule(5, 5, r#"{"business_unit_id": "2"}"#),
        ];
        assert_eq!(evaluate(&incident(Some("1"), None, Some(2)), &rules).unwrap().rule_id, 5);
    }

    #[test]
    fn numeric_forms_are_coerced() {
        let i = incident(Some("100.50"), Some(3), Some(2));
        assert!(rule(1, 1, r#"{"min_amount": 100.5}"#).predicate.matches(&i));
        assert!(rule(1, 1, r#"{"min_amount": "1e2"}"#).predicate.matches(&i));
        assert!(!rule(1, 1, r#"{"min_amount": "100.51"}"#).predicate.matches(&i));
        assert!(rule(1, 1, r#"{"basel_event_type_id": 3.0}"#).predicate.matches(&i));
        assert!(rule(1, 1, r#"{"basel_event_type_id": " 3 "}"#).predicate.matches(&i));
    }

    #[test]
    fn inactive_rules_and_ties() {
        let rules = vec![
            rule(1, 1, "{}").inactive(),
            rule(9, 5, "{}"),
            rule(7, 5, "{}"),
        ];
        assert_eq!(evaluate(&incident(None, None, None), &rules).unwrap().rule_id, 7);
    }

    #[test]
    fn non_object_predicates_are_rejected() {
        assert!(Predicate::from_json("[1, 2]").is_err());
        assert!(Predicate::from_json("{").is_err());
    }

    proptest::proptest! {
        #[test]
        fn first_match_is_the_lowest_matching_priority(
            amount in 0u32..50_000,
            floors in proptest::collection::vec(
                (0i64..20, 0u32..50_000, proptest::bool::ANY),
                0..8,
            ),
        ) {
            let rules: Vec<RoutingRule> = floors
                .iter()
                .enumerate()
                .map(|(i, (priority, floor, active))| {
                    let rule =
                        rule(i as Id + 1, *priority, &format!(r#"{{"min_amount": {floor}}}"#));
                    if *active { rule } else { rule.inactive() }
                })
                .collect();
            let subject = incident(Some(&amount.to_string()), None, None);

            let expected = rules
                .iter()
                .filter(|r| r.active && r.predicate.matches(&subject))
                .min_by_key(|r| (r.priority, r.id))
                .map(|r| r.id);

            proptest::prop_assert_eq!(evaluate(&subject, &rules).map(|hit| hit.rule_id), expected);
        }
    }
}
