use anyhow::Context;
use oprisk_workflow::control::{ControlFrequency, ControlPatch, NewControl};
use oprisk_workflow::incident::NewIncident;
use oprisk_workflow::measure::NewMeasure;
use oprisk_workflow::risk::{NewRisk, Risk, RiskCategory, RiskPatch, RiskStatus};
use oprisk_workflow::{Config, Error, Id, Role, Services, Store, Treatment, User};
use tempfile::tempdir;

struct Desk {
    _dir: tempfile::TempDir,
    store: Store,
    services: Services,
    employee: User,
    manager: User,
    officer: User,
    category: Id,
}

fn desk() -> anyhow::Result<Desk> {
    let dir = tempdir()?;
    let store = Store::open(dir.path().join("risks.db"))?;

    let manager = User::new(store.next_id()?, "mgr@bank.test", Role::Manager).in_business_unit(10);
    let employee =
        User::new(store.next_id()?, "emp@bank.test", Role::Employee).in_business_unit(10);
    let officer =
        User::new(store.next_id()?, "ro@bank.test", Role::RiskOfficer).in_business_unit(10);
    for user in [&manager, &employee, &officer] {
        store.put(user)?;
    }
    let category = RiskCategory::new(store.next_id()?, "External fraud", [1, 2]);
    store.put(&category)?;

    let services = Services::new(store.clone(), Config::default());
    Ok(Desk {
        _dir: dir,
        store,
        services,
        employee,
        manager,
        officer,
        category: category.id,
    })
}

fn draft(d: &Desk) -> anyhow::Result<Risk> {
    let new = NewRisk::new("Card skimming", "Skimming devices on ATMs", 10, d.manager.id)
        .in_category(d.category)
        .with_basel_event_type(1)
        .with_inherent(2, 2);
    Ok(d.services.risks.create(&d.manager, new)?)
}

fn residual(likelihood: u8, impact: u8) -> RiskPatch {
    RiskPatch {
        residual_likelihood: Some(Some(likelihood)),
        residual_impact: Some(Some(impact)),
        ..Default::default()
    }
}

fn active(d: &Desk) -> anyhow::Result<Risk> {
    let id = draft(d)?.id;
    d.services.risks.submit_for_review(id, &d.manager)?;
    d.services.risks.update(id, &d.officer, residual(1, 2))?;
    Ok(d.services.risks.approve(id, &d.officer)?)
}

#[test]
fn residual_above_inherent_blocks_approval() -> anyhow::Result<()> {
    let d = desk()?;
    let risks = &d.services.risks;
    let id = draft(&d)?.id;

    let assessed = risks.submit_for_review(id, &d.manager).context("submit failed")?;
    assert_eq!(assessed.status, RiskStatus::Assessed);
    assert_eq!(assessed.submitted_by, Some(d.manager.id));
    assert!(assessed.submitted_for_review_at.is_some());

    risks.update(id, &d.officer, residual(3, 3))?;
    let err = risks.approve(id, &d.officer).unwrap_err();
    assert_eq!(err.to_string(), "Residual risk score cannot exceed inherent risk score.");
    assert_eq!(err.treatment(), Treatment::InvalidRequest);
    assert_eq!(risks.get(id, &d.officer)?.status, RiskStatus::Assessed);

    risks.update(id, &d.officer, residual(1, 2))?;
    let approved = risks.approve(id, &d.officer)?;
    assert_eq!(approved.status, RiskStatus::Active);
    assert_eq!(approved.validated_by, Some(d.officer.id));
    assert_eq!(approved.residual_score(), Some(2));
    Ok(())
}

#[test]
fn create_checks_role_and_owner_placement() -> anyhow::Result<()> {
    let d = desk()?;
    let risks = &d.services.risks;

    let err = risks
        .create(&d.employee, NewRisk::new("Fraud", "Card fraud", 10, d.employee.id))
        .unwrap_err();
    assert!(matches!(err, Error::Permission(_)));

    let err = risks
        .create(&d.manager, NewRisk::new("Fraud", "Card fraud", 20, d.manager.id))
        .unwrap_err();
    assert_eq!(err.to_string(), "Owner must belong to the selected Business Unit.");
    assert_eq!(err.treatment(), Treatment::Forbidden);

    let err = risks
        .create(
            &d.manager,
            NewRisk::new("Fraud", "Card fraud", 10, d.manager.id).with_inherent(6, 1),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    Ok(())
}

#[test]
fn submission_prerequisites() -> anyhow::Result<()> {
    let d = desk()?;
    let risks = &d.services.risks;

    let bare = risks.create(&d.manager, NewRisk::new("Fraud", "Card fraud", 10, d.manager.id))?;
    let err = risks.submit_for_review(bare.id, &d.manager).unwrap_err();
    assert_eq!(err.to_string(), "Inherent risk scores required before submission.");

    let patch = RiskPatch {
        inherent_likelihood: Some(Some(3)),
        inherent_impact: Some(Some(2)),
        ..Default::default()
    };
    risks.update(bare.id, &d.manager, patch)?;
    let err = risks.submit_for_review(bare.id, &d.manager).unwrap_err();
    assert_eq!(err.to_string(), "Risk category must be selected.");

    let patch = RiskPatch {
        risk_category_id: Some(Some(d.category)),
        basel_event_type_id: Some(Some(7)),
        ..Default::default()
    };
    let err = risks.update(bare.id, &d.manager, patch).unwrap_err();
    assert_eq!(err.to_string(), "Basel event type is not valid for risk category.");
    assert_eq!(risks.get(bare.id, &d.manager)?.risk_category_id, None);
    Ok(())
}

#[test]
fn approval_needs_residual_scores_and_basel_type() -> anyhow::Result<()> {
    let d = desk()?;
    let risks = &d.services.risks;
    let new = NewRisk::new("Fraud", "Card fraud", 10, d.manager.id)
        .in_category(d.category)
        .with_inherent(3, 3);
    let id = risks.create(&d.manager, new)?.id;
    risks.submit_for_review(id, &d.manager)?;

    let err = risks.approve(id, &d.officer).unwrap_err();
    assert_eq!(err.to_string(), "Residual risk scores required.");

    risks.update(id, &d.officer, residual(1, 1))?;
    let err = risks.approve(id, &d.officer).unwrap_err();
    assert_eq!(err.to_string(), "Basel event type must be selected.");

    let err = risks.approve(id, &d.manager).unwrap_err();
    assert!(matches!(err, Error::Transition(_)));
    Ok(())
}

#[test]
fn send_back_reassess_and_retire() -> anyhow::Result<()> {
    let d = desk()?;
    let risks = &d.services.risks;
    let id = draft(&d)?.id;
    risks.submit_for_review(id, &d.manager)?;

    let err = risks.send_back(id, &d.officer, "Too short").unwrap_err();
    assert_eq!(err.to_string(), "Reason must be at least 20 characters.");

    let back = risks.send_back(id, &d.officer, "Inherent impact looks understated.")?;
    assert_eq!(back.status, RiskStatus::Draft);
    assert_eq!(back.notes.latest().and_then(|n| n.label.as_deref()), Some("RETURNED FOR REVISION"));

    risks.submit_for_review(id, &d.manager)?;
    risks.update(id, &d.officer, residual(1, 2))?;
    let approved = risks.approve(id, &d.officer)?;

    let reassess = risks.request_reassessment(id, &d.officer)?;
    assert_eq!(reassess.status, RiskStatus::Assessed);
    assert!(reassess.submitted_for_review_at >= approved.submitted_for_review_at);

    let retired = risks.retire(id, &d.officer, "Branch network sold to another bank.")?;
    assert_eq!(retired.status, RiskStatus::Retired);
    assert_eq!(retired.retirement_reason.as_deref(), Some("Branch network sold to another bank."));
    assert!(retired.notes.render().contains("Branch network sold to another bank."));

    let err = risks.add_comment(id, &d.officer, "Any news?").unwrap_err();
    assert_eq!(err.to_string(), "Retired risk cannot be modified.");
    Ok(())
}

#[test]
fn comments_need_participation() -> anyhow::Result<()> {
    let d = desk()?;
    let risks = &d.services.risks;
    let id = draft(&d)?.id;

    let err = risks.add_comment(id, &d.employee, "I saw one too.").unwrap_err();
    assert_eq!(err.treatment(), Treatment::Forbidden);

    let commented = risks.add_comment(id, &d.manager, "Vendor contacted.")?;
    assert_eq!(commented.notes.latest().map(|n| n.body.as_str()), Some("Vendor contacted."));
    risks.add_comment(id, &d.officer, "Noted.")?;
    Ok(())
}

#[test]
fn incident_and_measure_links() -> anyhow::Result<()> {
    let d = desk()?;
    let risks = &d.services.risks;
    let id = draft(&d)?.id;
    let incident = d
        .services
        .incidents
        .create(&d.employee, NewIncident::new("ATM skimming", "Device found"))?;
    let measure = d
        .services
        .measures
        .create(&d.officer, NewMeasure::new("Replace readers", d.employee.id))?;

    risks.link_incident(id, &d.manager, incident.id)?;
    let err = risks.link_incident(id, &d.manager, incident.id).unwrap_err();
    assert_eq!(err.to_string(), "Incident already linked.");
    assert_eq!(risks.get(id, &d.manager)?.incident_ids.len(), 1);

    risks.link_measure(id, &d.officer, measure.id)?;
    risks.unlink_measure(id, &d.officer, measure.id)?;
    let err = risks.unlink_measure(id, &d.officer, measure.id).unwrap_err();
    assert_eq!(err.to_string(), "Measure is not linked.");

    let err = risks.link_measure(id, &d.employee, measure.id).unwrap_err();
    assert!(matches!(err, Error::Permission(_)));
    Ok(())
}

#[test]
fn control_links_guard_active_risks() -> anyhow::Result<()> {
    let d = desk()?;
    let risks = &d.services.risks;
    let controls = &d.services.controls;
    let first = controls.create(
        &d.officer,
        NewControl::new(
            "Reader inspection",
            "Weekly ATM check",
            ControlFrequency::Weekly,
            10,
            d.officer.id,
        ),
    )?;
    let second = controls.create(
        &d.officer,
        NewControl::new(
            "Anti-skimming plates",
            "Hardware guard",
            ControlFrequency::Continuous,
            10,
            d.officer.id,
        ),
    )?;

    let id = active(&d)?.id;
    risks.link_control(id, &d.officer, first.id, Some("primary"))?;
    let err = risks.link_control(id, &d.officer, first.id, None).unwrap_err();
    assert_eq!(err.to_string(), "Control already linked.");

    let err = risks.unlink_control(id, &d.officer, first.id).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Cannot unlink last control from ACTIVE risk. At least one control must remain."
    );

    risks.link_control(id, &d.officer, second.id, None)?;
    let risk = risks.unlink_control(id, &d.officer, first.id)?;
    assert_eq!(risk.controls.keys().copied().collect::<Vec<_>>(), vec![second.id]);

    let err = risks.unlink_control(id, &d.officer, first.id).unwrap_err();
    assert!(matches!(err, Error::Idempotency(_)));
    Ok(())
}

#[test]
fn inactive_controls_and_retired_risks_refuse_links() -> anyhow::Result<()> {
    let d = desk()?;
    let risks = &d.services.risks;
    let control = d.services.controls.create(
        &d.officer,
        NewControl::new(
            "Dual control",
            "Two keys for the vault",
            ControlFrequency::Daily,
            10,
            d.officer.id,
        ),
    )?;
    let id = draft(&d)?.id;
    d.services
        .controls
        .update(control.id, &d.officer, ControlPatch::deactivate())?;

    let err = risks.link_control(id, &d.officer, control.id, None).unwrap_err();
    assert_eq!(err.to_string(), "Cannot link inactive controls.");

    let incident = d
        .services
        .incidents
        .create(&d.employee, NewIncident::new("Vault left open", "Overnight"))?;
    risks.submit_for_review(id, &d.manager)?;
    risks.retire(id, &d.officer, "Replaced by a broader vault risk.")?;
    let err = risks.link_incident(id, &d.officer, incident.id).unwrap_err();
    assert_eq!(err.to_string(), "Cannot link retired risks.");
    Ok(())
}

#[test]
fn delete_and_visibility() -> anyhow::Result<()> {
    let d = desk()?;
    let risks = &d.services.risks;
    let outsider =
        User::new(d.store.next_id()?, "far@bank.test", Role::RiskOfficer).in_business_unit(20);
    let removed = draft(&d)?.id;
    let kept = draft(&d)?.id;

    assert_eq!(risks.get(kept, &outsider).unwrap_err().treatment(), Treatment::NotFound);
    assert_eq!(risks.list(&d.employee)?.len(), 2);

    let err = risks.delete(removed, &d.employee).unwrap_err();
    assert!(matches!(err, Error::Permission(_)));
    risks.delete(removed, &d.officer)?;
    assert_eq!(risks.list(&d.employee)?.len(), 1);

    risks.submit_for_review(kept, &d.manager)?;
    let err = risks.delete(kept, &d.manager).unwrap_err();
    assert_eq!(err.to_string(), "Only DRAFT risks can be deleted.");
    Ok(())
}

#[test]
fn context_for_officer_on_assessed_risk() -> anyhow::Result<()> {
    let d = desk()?;
    let id = draft(&d)?.id;
    d.services.risks.submit_for_review(id, &d.manager)?;

    let ctx = d.services.risks.context(id, &d.officer)?;
    let offered: Vec<&str> = ctx.available_transitions.iter().map(|a| a.action).collect();
    assert_eq!(offered, vec!["send-back", "approve", "retire"]);
    assert!(ctx.editable_fields.contains(&"residual_impact"));
    assert!(!ctx.permissions.can_delete);

    let ctx = d.services.risks.context(id, &d.manager)?;
    assert!(!ctx.permissions.can_edit);
    assert!(!ctx.permissions.can_transition);
    Ok(())
}
