use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use super::*;
use crate::model::*;
use crate::orchestrator::Workflow;
use crate::store::{AppointmentStore, BayStore, Store, StoreError};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("bayflow_test_workflow");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open_store(name: &str) -> Arc<Store> {
    Arc::new(Store::open(test_wal_path(name)).unwrap())
}

fn harness(name: &str) -> (Workflow, Arc<Store>) {
    let store = open_store(name);
    (Workflow::over(store.clone()), store)
}

fn tech(name: &str) -> Actor {
    Actor::new(name, Role::Service)
}

fn customer() -> Actor {
    Actor::new(Ulid::new().to_string(), Role::Customer)
}

fn booking(kind: AppointmentKind, subject: Ulid, slot: Option<&str>) -> NewAppointment {
    NewAppointment {
        id: None,
        kind,
        subject_id: subject,
        scheduled_date: NaiveDate::from_ymd_opt(2026, 11, 20).unwrap(),
        time_slot: slot.map(String::from),
        customer_name: "Priya Anand".into(),
        customer_email: "priya@example.com".into(),
        customer_phone: Some("555-0199".into()),
    }
}

async fn confirmed(wf: &Workflow, who: &Actor, slot: &str) -> Appointment {
    let appt = wf
        .appointments
        .book(who, booking(AppointmentKind::Service, Ulid::new(), Some(slot)))
        .await
        .unwrap();
    wf.appointments
        .set_status(&tech("desk"), appt.id, "confirmed", None)
        .await
        .unwrap()
}

async fn bay(wf: &Workflow, number: u32) -> Bay {
    wf.bays
        .create_bay(
            &tech("desk"),
            NewBay {
                id: None,
                number,
                notes: None,
                last_maintenance: None,
            },
        )
        .await
        .unwrap()
}

async fn inbox_len(wf: &Workflow, who: &Actor) -> usize {
    wf.inbox.list(who, PageRequest::default()).await.unwrap().total
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn confirming_notifies_the_customer() {
    let (wf, _) = harness("scenario_a.wal");
    let who = customer();
    let appt = wf
        .appointments
        .book(&who, booking(AppointmentKind::Service, Ulid::new(), Some("08:30")))
        .await
        .unwrap();
    assert_eq!(appt.status, AppointmentStatus::Pending);
    assert_eq!(inbox_len(&wf, &who).await, 0);

    let updated = wf
        .appointments
        .set_status(&tech("s1"), appt.id, "confirmed", None)
        .await
        .unwrap();
    assert_eq!(updated.status, AppointmentStatus::Confirmed);

    let inbox = wf.inbox.list(&who, PageRequest::default()).await.unwrap();
    assert_eq!(inbox.total, 1);
    assert!(inbox.items[0].message.contains("confirmed"));
    assert!(!inbox.items[0].read);
}

#[tokio::test]
async fn assign_seats_and_starts_work() {
    let (wf, _) = harness("scenario_b.wal");
    let p = confirmed(&wf, &customer(), "09:00").await;
    let bay1 = bay(&wf, 1).await;

    let seated = wf.bays.assign(&tech("s1"), bay1.id, p.id, None).await.unwrap();
    assert_eq!(seated.status, BayStatus::Occupied);
    assert_eq!(seated.current_booking, Some(p.id));
    let p = wf.appointments.find(p.id).await.unwrap();
    assert_eq!(p.status, AppointmentStatus::InProgress);
}

#[tokio::test]
async fn second_bay_is_refused_naming_the_first() {
    let (wf, _) = harness("scenario_c.wal");
    let p = confirmed(&wf, &customer(), "09:30").await;
    let bay1 = bay(&wf, 1).await;
    let bay2 = bay(&wf, 2).await;
    wf.bays.assign(&tech("s1"), bay1.id, p.id, None).await.unwrap();

    let err = wf.bays.assign(&tech("s1"), bay2.id, p.id, None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::AppointmentAlreadySeated { bay_number: 1 }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let untouched = wf.bays.get_bay(&tech("s1"), bay2.id).await.unwrap();
    assert_eq!(untouched.status, BayStatus::Available);
    assert!(untouched.current_booking.is_none());
}

#[tokio::test]
async fn half_seated_appointment_cannot_take_a_second_bay() {
    let (wf, store) = harness("scenario_c_half.wal");
    let p = confirmed(&wf, &customer(), "10:00").await;
    let bay1 = bay(&wf, 1).await;
    let bay2 = bay(&wf, 2).await;
    // first write of an assign landed, second did not
    store.seat_bay(bay1.id, p.id).await.unwrap();

    let err = wf.bays.assign(&tech("s1"), bay2.id, p.id, None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::AppointmentAlreadySeated { bay_number: 1 }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(store.get_bay(bay2.id).await.unwrap().status, BayStatus::Available);
    assert_eq!(
        wf.appointments.find(p.id).await.unwrap().status,
        AppointmentStatus::Confirmed
    );
}

#[tokio::test]
async fn completion_with_free_bay_closes_everything() {
    let (wf, _) = harness("scenario_d.wal");
    let s1 = tech("s1");
    let p = confirmed(&wf, &customer(), "11:00").await;
    let bay1 = bay(&wf, 1).await;
    wf.bays.assign(&s1, bay1.id, p.id, None).await.unwrap();

    let row = wf
        .progress
        .create(
            &s1,
            NewProgress {
                id: None,
                appointment_id: p.id,
                status: "in_progress".into(),
                notes: Some("brake pads".into()),
                estimated_completion: None,
            },
        )
        .await
        .unwrap();
    let done = wf
        .progress
        .update(
            &s1,
            row.id,
            ProgressUpdate {
                status: Some("completed".into()),
                free_bay: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(done.status, ProgressStatus::Completed);
    assert_eq!(done.notes.as_deref(), Some("brake pads"));

    assert_eq!(
        wf.appointments.find(p.id).await.unwrap().status,
        AppointmentStatus::Completed
    );
    let bay1 = wf.bays.get_bay(&s1, bay1.id).await.unwrap();
    assert_eq!(bay1.status, BayStatus::Available);
    assert!(bay1.current_booking.is_none());
}

#[tokio::test]
async fn only_the_author_edits_progress() {
    let (wf, _) = harness("scenario_e.wal");
    let s1 = tech("s1");
    let s2 = tech("s2");
    let p = confirmed(&wf, &customer(), "12:00").await;
    let row = wf
        .progress
        .create(
            &s1,
            NewProgress {
                id: None,
                appointment_id: p.id,
                status: "waiting_parts".into(),
                notes: None,
                estimated_completion: None,
            },
        )
        .await
        .unwrap();

    let err = wf
        .progress
        .update(
            &s2,
            row.id,
            ProgressUpdate {
                status: Some("completed".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let err = wf.progress.delete(&s2, row.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let page = wf
        .progress
        .list(&s1, &ProgressFilter::default(), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.items, vec![row.clone()]);
    assert_eq!(
        wf.appointments.find(p.id).await.unwrap().status,
        AppointmentStatus::Confirmed
    );
    wf.progress.delete(&s1, row.id).await.unwrap();
}

#[tokio::test]
async fn cancelling_a_completed_appointment_is_illegal() {
    let (wf, store) = harness("scenario_f.wal");
    let who = customer();
    let p = confirmed(&wf, &who, "13:00").await;
    wf.appointments.complete(p.id).await.unwrap();
    let before = inbox_len(&wf, &who).await;

    let err = wf
        .appointments
        .set_status(&tech("s1"), p.id, "cancelled", Some("changed mind".into()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::IllegalTransition(crate::lifecycle::IllegalTransition {
            from: AppointmentStatus::Completed,
            to: AppointmentStatus::Cancelled,
        })
    ));
    assert_eq!(store.get_appointment(p.id).await.unwrap().status, AppointmentStatus::Completed);
    assert_eq!(inbox_len(&wf, &who).await, before);
}

// ── Properties ───────────────────────────────────────────────────

#[tokio::test]
async fn assign_twice_is_a_no_op() {
    let (wf, store) = harness("assign_idempotent.wal");
    let who = customer();
    let p = confirmed(&wf, &who, "14:00").await;
    let bay1 = bay(&wf, 1).await;

    let first = wf.bays.assign(&tech("s1"), bay1.id, p.id, None).await.unwrap();
    let appt_after_first = store.get_appointment(p.id).await.unwrap();
    let second = wf
        .bays
        .assign(&tech("s1"), bay1.id, p.id, Some(BayStatus::Occupied))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(store.get_appointment(p.id).await.unwrap(), appt_after_first);
}

#[tokio::test]
async fn concurrent_assigns_seat_one_bay() {
    let (wf, store) = harness("assign_race.wal");
    let p = confirmed(&wf, &customer(), "15:00").await;
    let mut bays = Vec::new();
    for n in 1..=6 {
        bays.push(bay(&wf, n).await.id);
    }

    let mut handles = Vec::new();
    for bay_id in bays {
        let wf = wf.clone();
        handles.push(tokio::spawn(async move {
            wf.bays.assign(&tech("racer"), bay_id, p.id, None).await
        }));
    }
    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert!(
                matches!(
                    e,
                    WorkflowError::AppointmentAlreadySeated { .. }
                        | WorkflowError::AppointmentNotConfirmed { .. }
                ),
                "unexpected loser error: {e:?}"
            ),
        }
    }
    assert_eq!(wins, 1);
    let holders = store
        .list_bays()
        .await
        .into_iter()
        .filter(|b| b.current_booking == Some(p.id))
        .count();
    assert_eq!(holders, 1);
    assert!(store.list_bays().await.iter().all(Bay::is_consistent));
}

#[tokio::test]
async fn assign_preconditions_fail_in_order() {
    let (wf, _) = harness("assign_order.wal");
    let s1 = tech("s1");
    let who = customer();
    let bay1 = bay(&wf, 1).await;

    let err = wf.bays.assign(&s1, Ulid::new(), Ulid::new(), None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound { entity: "bay", .. }));
    let err = wf.bays.assign(&s1, bay1.id, Ulid::new(), None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound { entity: "appointment", .. }));

    let pending = wf
        .appointments
        .book(&who, booking(AppointmentKind::Service, Ulid::new(), Some("16:00")))
        .await
        .unwrap();
    let err = wf
        .bays
        .assign(&s1, bay1.id, pending.id, Some(BayStatus::Available))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::AppointmentNotConfirmed {
            status: AppointmentStatus::Pending
        }
    ));

    let p = confirmed(&wf, &who, "16:30").await;
    let err = wf
        .bays
        .assign(&s1, bay1.id, p.id, Some(BayStatus::Available))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InconsistentBayState(_)));

    wf.bays.set_maintenance(&s1, bay1.id, true).await.unwrap();
    let err = wf.bays.assign(&s1, bay1.id, p.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::BayUnavailable {
            bay_number: 1,
            status: BayStatus::Maintenance
        }
    ));
    assert_eq!(
        wf.appointments.find(p.id).await.unwrap().status,
        AppointmentStatus::Confirmed
    );
}

#[tokio::test]
async fn slot_cannot_be_double_booked_until_cancelled() {
    let (wf, _) = harness("slot_unique.wal");
    let subject = Ulid::new();
    let first = wf
        .appointments
        .book(&customer(), booking(AppointmentKind::Service, subject, Some("10:00")))
        .await
        .unwrap();
    let err = wf
        .appointments
        .book(&customer(), booking(AppointmentKind::Service, subject, Some("10:00")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "slot_taken");

    wf.appointments
        .set_status(&tech("s1"), first.id, "cancelled", None)
        .await
        .unwrap();
    wf.appointments
        .book(&customer(), booking(AppointmentKind::Service, subject, Some("10:00")))
        .await
        .unwrap();
}

#[tokio::test]
async fn booking_validates_slot_rules() {
    let (wf, _) = harness("booking_rules.wal");
    let who = customer();
    let err = wf
        .appointments
        .book(&who, booking(AppointmentKind::Service, Ulid::new(), None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let err = wf
        .appointments
        .book(&who, booking(AppointmentKind::TestDrive, Ulid::new(), Some("10:00")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let err = wf
        .appointments
        .book(&tech("s1"), booking(AppointmentKind::TestDrive, Ulid::new(), None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn desks_only_see_their_own_kind() {
    let (wf, _) = harness("desk_scope.wal");
    let who = customer();
    let drive = wf
        .appointments
        .book(&who, booking(AppointmentKind::TestDrive, Ulid::new(), None))
        .await
        .unwrap();
    let service = wf
        .appointments
        .book(&who, booking(AppointmentKind::Service, Ulid::new(), Some("08:00")))
        .await
        .unwrap();
    let sale = Actor::new("sam", Role::Sale);

    let page = wf
        .appointments
        .list(&sale, &AppointmentFilter::default(), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.items.iter().map(|a| a.id).collect::<Vec<_>>(), vec![drive.id]);

    let err = wf
        .appointments
        .set_status(&sale, service.id, "confirmed", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    wf.appointments
        .set_status(&sale, drive.id, "confirmed", None)
        .await
        .unwrap();

    let mine = wf
        .appointments
        .list(&who, &AppointmentFilter::default(), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(mine.total, 2);
    let stranger = customer();
    assert_eq!(
        wf.appointments.get(&stranger, drive.id).await.unwrap_err().kind(),
        ErrorKind::Forbidden
    );
    assert_eq!(
        wf.appointments
            .set_status(&who, drive.id, "cancelled", None)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::Forbidden
    );
}

#[tokio::test]
async fn list_filters_by_customer_text_and_dates() {
    let (wf, _) = harness("list_filters.wal");
    let who = customer();
    let mut early = booking(AppointmentKind::Service, Ulid::new(), Some("09:00"));
    early.scheduled_date = NaiveDate::from_ymd_opt(2026, 11, 2).unwrap();
    let early = wf.appointments.book(&who, early).await.unwrap();
    let mut late = booking(AppointmentKind::Service, Ulid::new(), Some("09:00"));
    late.scheduled_date = NaiveDate::from_ymd_opt(2026, 11, 30).unwrap();
    late.customer_name = "Tomasz Zielinski".into();
    late.customer_email = "tz@example.org".into();
    let late = wf.appointments.book(&who, late).await.unwrap();

    let all = wf
        .appointments
        .list(&tech("s1"), &AppointmentFilter::default(), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(all.items.iter().map(|a| a.id).collect::<Vec<_>>(), vec![early.id, late.id]);

    let by_name = AppointmentFilter {
        customer: Some("zielin".into()),
        ..Default::default()
    };
    let page = wf
        .appointments
        .list(&tech("s1"), &by_name, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.items.iter().map(|a| a.id).collect::<Vec<_>>(), vec![late.id]);

    let window = AppointmentFilter {
        date_to: NaiveDate::from_ymd_opt(2026, 11, 15),
        status: Some(AppointmentStatus::Pending),
        ..Default::default()
    };
    let page = wf
        .appointments
        .list(&tech("s1"), &window, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.items.iter().map(|a| a.id).collect::<Vec<_>>(), vec![early.id]);
}

#[tokio::test]
async fn unknown_status_is_invalid_status() {
    let (wf, _) = harness("invalid_status.wal");
    let p = confirmed(&wf, &customer(), "17:00").await;
    let err = wf
        .appointments
        .set_status(&tech("s1"), p.id, "done", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStatus);
    let err = wf
        .progress
        .create(
            &tech("s1"),
            NewProgress {
                id: None,
                appointment_id: p.id,
                status: "pending".into(),
                notes: None,
                estimated_completion: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStatus);
}

#[tokio::test]
async fn cancellation_notice_carries_the_reason() {
    let (wf, _) = harness("cancel_reason.wal");
    let who = customer();
    let p = confirmed(&wf, &who, "18:00").await;
    wf.appointments
        .set_status(&tech("s1"), p.id, "cancelled", Some("parts on backorder".into()))
        .await
        .unwrap();
    let inbox = wf.inbox.list(&who, PageRequest::default()).await.unwrap();
    assert_eq!(inbox.total, 2);
    let notice = inbox
        .items
        .iter()
        .find(|n| n.message.contains("cancelled"))
        .unwrap();
    assert!(notice.message.contains("parts on backorder"));
    assert!(notice.message.contains("2026-11-20"));

    let err = wf.inbox.mark_read(&customer(), notice.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(wf.inbox.mark_read(&who, notice.id).await.unwrap().read);
}

#[tokio::test]
async fn cancellation_notice_ignores_an_earlier_note() {
    let (wf, _) = harness("cancel_stale_note.wal");
    let who = customer();
    let appt = wf
        .appointments
        .book(&who, booking(AppointmentKind::Service, Ulid::new(), Some("10:00")))
        .await
        .unwrap();
    wf.appointments
        .set_status(&tech("desk"), appt.id, "confirmed", Some("bring spare key".into()))
        .await
        .unwrap();
    wf.appointments
        .set_status(&tech("desk"), appt.id, "cancelled", None)
        .await
        .unwrap();

    let inbox = wf.inbox.list(&who, PageRequest::default()).await.unwrap();
    let notice = inbox
        .items
        .iter()
        .find(|n| n.message.contains("cancelled"))
        .unwrap();
    assert!(!notice.message.contains("spare key"), "{}", notice.message);
    assert!(!notice.message.contains("Reason"));
}

#[tokio::test]
async fn occupied_bay_refuses_maintenance_and_delete() {
    let (wf, _) = harness("bay_guards.wal");
    let s1 = tech("s1");
    let p = confirmed(&wf, &customer(), "08:00").await;
    let bay1 = bay(&wf, 1).await;
    wf.bays.assign(&s1, bay1.id, p.id, None).await.unwrap();

    let err = wf.bays.set_maintenance(&s1, bay1.id, true).await.unwrap_err();
    assert!(matches!(err, WorkflowError::BayOccupied { bay_number: 1, .. }));
    let err = wf.bays.delete(&s1, bay1.id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::BayOccupied { bay_number: 1, .. }));

    let err = wf
        .bays
        .create_bay(
            &s1,
            NewBay {
                id: None,
                number: 1,
                notes: None,
                last_maintenance: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "duplicate_bay_number");
}

#[tokio::test]
async fn update_bay_dispatches_by_precedence() {
    let (wf, _) = harness("bay_patch.wal");
    let s1 = tech("s1");
    let p = confirmed(&wf, &customer(), "09:15").await;
    let bay1 = bay(&wf, 1).await;

    let seated = wf
        .bays
        .update_bay(
            &s1,
            bay1.id,
            BayUpdate {
                status: Some(BayStatus::Occupied),
                current_booking: Some(Some(p.id)),
                notes: Some("lift 2".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(seated.current_booking, Some(p.id));
    assert_eq!(seated.notes.as_deref(), Some("lift 2"));

    let err = wf
        .bays
        .update_bay(
            &s1,
            bay1.id,
            BayUpdate {
                status: Some(BayStatus::Occupied),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InconsistentBayState(_)));

    let serviced = wf
        .bays
        .update_bay(
            &s1,
            bay1.id,
            BayUpdate {
                status: Some(BayStatus::Maintenance),
                current_booking: Some(None),
                last_maintenance: Some(1_700_000_000_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(serviced.status, BayStatus::Maintenance);
    assert!(serviced.current_booking.is_none());
    assert_eq!(serviced.last_maintenance, Some(1_700_000_000_000));
    // release never touches the appointment
    assert_eq!(
        wf.appointments.find(p.id).await.unwrap().status,
        AppointmentStatus::InProgress
    );

    let back = wf
        .bays
        .update_bay(
            &s1,
            bay1.id,
            BayUpdate {
                status: Some(BayStatus::Available),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(back.status, BayStatus::Available);
}

#[tokio::test]
async fn bays_are_listed_by_number_for_service_staff_only() {
    let (wf, _) = harness("bay_list.wal");
    for n in [3, 1, 2] {
        bay(&wf, n).await;
    }
    let page = wf
        .bays
        .list_bays(&tech("s1"), &BayFilter::default(), PageRequest { page: 1, page_size: 2 })
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.iter().map(|b| b.number).collect::<Vec<_>>(), vec![1, 2]);

    let err = wf
        .bays
        .list_bays(&Actor::new("sam", Role::Sale), &BayFilter::default(), PageRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn completing_unseated_work_is_tolerated() {
    let (wf, _) = harness("complete_unseated.wal");
    let s1 = tech("s1");
    let p = confirmed(&wf, &customer(), "10:45").await;
    let row = wf
        .progress
        .create(
            &s1,
            NewProgress {
                id: None,
                appointment_id: p.id,
                status: "testing".into(),
                notes: None,
                estimated_completion: Some(1_800_000_000_000),
            },
        )
        .await
        .unwrap();
    wf.progress
        .update(
            &s1,
            row.id,
            ProgressUpdate {
                status: Some("completed".into()),
                free_bay: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        wf.appointments.find(p.id).await.unwrap().status,
        AppointmentStatus::Completed
    );
}

#[tokio::test]
async fn completing_a_cancelled_appointment_writes_nothing() {
    let (wf, store) = harness("complete_cancelled.wal");
    let s1 = tech("s1");
    let p = confirmed(&wf, &customer(), "11:15").await;
    let row = wf
        .progress
        .create(
            &s1,
            NewProgress {
                id: None,
                appointment_id: p.id,
                status: "in_progress".into(),
                notes: None,
                estimated_completion: None,
            },
        )
        .await
        .unwrap();
    wf.appointments
        .set_status(&s1, p.id, "cancelled", None)
        .await
        .unwrap();

    let err = wf
        .progress
        .update(
            &s1,
            row.id,
            ProgressUpdate {
                status: Some("completed".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);
    assert_eq!(
        crate::store::ProgressStore::get_progress(store.as_ref(), row.id)
            .await
            .unwrap()
            .status,
        ProgressStatus::InProgress
    );
}

#[tokio::test]
async fn progress_list_hides_cancelled_and_foreign_rows() {
    let (wf, _) = harness("progress_list.wal");
    let s1 = tech("s1");
    let live = confirmed(&wf, &customer(), "12:15").await;
    let dropped = confirmed(&wf, &customer(), "12:45").await;
    let new_row = |appointment_id| NewProgress {
        id: None,
        appointment_id,
        status: "in_progress".into(),
        notes: None,
        estimated_completion: None,
    };
    let first = wf.progress.create(&s1, new_row(live.id)).await.unwrap();
    let second = wf.progress.create(&s1, new_row(live.id)).await.unwrap();
    wf.progress.create(&s1, new_row(dropped.id)).await.unwrap();
    wf.progress.create(&tech("s2"), new_row(live.id)).await.unwrap();
    wf.appointments
        .set_status(&s1, dropped.id, "cancelled", None)
        .await
        .unwrap();

    let page = wf
        .progress
        .list(&s1, &ProgressFilter::default(), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    // newest first
    let ids: Vec<_> = page.items.iter().map(|p| p.id).collect();
    assert!(ids.contains(&first.id) && ids.contains(&second.id));
    assert!(page.items[0].created_at >= page.items[1].created_at);
}

// ── Partial success ──────────────────────────────────────────────

/// Delegates to the real store but can be told to fail status writes or
/// bay releases.
struct Flaky {
    inner: Arc<Store>,
    fail_status: AtomicBool,
    fail_vacate: AtomicBool,
}

impl Flaky {
    fn injected() -> StoreError {
        StoreError::Wal("injected fsync failure".into())
    }
}

#[async_trait]
impl AppointmentStore for Flaky {
    async fn get_appointment(&self, id: Ulid) -> Option<Appointment> {
        self.inner.get_appointment(id).await
    }

    async fn list_appointments(&self) -> Vec<Appointment> {
        self.inner.list_appointments().await
    }

    async fn insert_appointment(&self, appointment: Appointment) -> Result<(), StoreError> {
        self.inner.insert_appointment(appointment).await
    }

    async fn compare_and_set_status(
        &self,
        id: Ulid,
        expected: AppointmentStatus,
        next: AppointmentStatus,
        note: Option<String>,
    ) -> Result<Appointment, StoreError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.compare_and_set_status(id, expected, next, note).await
    }
}

#[async_trait]
impl BayStore for Flaky {
    async fn get_bay(&self, id: Ulid) -> Option<Bay> {
        self.inner.get_bay(id).await
    }

    async fn list_bays(&self) -> Vec<Bay> {
        self.inner.list_bays().await
    }

    async fn insert_bay(&self, bay: Bay) -> Result<(), StoreError> {
        self.inner.insert_bay(bay).await
    }

    async fn bay_for_appointment(&self, appointment_id: Ulid) -> Option<Bay> {
        self.inner.bay_for_appointment(appointment_id).await
    }

    async fn seat_bay(&self, bay_id: Ulid, appointment_id: Ulid) -> Result<Bay, StoreError> {
        self.inner.seat_bay(bay_id, appointment_id).await
    }

    async fn vacate_bay(&self, bay_id: Ulid) -> Result<Bay, StoreError> {
        if self.fail_vacate.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.vacate_bay(bay_id).await
    }

    async fn vacate_bay_if_held(
        &self,
        bay_id: Ulid,
        appointment_id: Ulid,
    ) -> Result<Option<Bay>, StoreError> {
        if self.fail_vacate.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.vacate_bay_if_held(bay_id, appointment_id).await
    }

    async fn set_bay_maintenance(&self, bay_id: Ulid, on: bool) -> Result<Bay, StoreError> {
        self.inner.set_bay_maintenance(bay_id, on).await
    }

    async fn update_bay_details(
        &self,
        bay_id: Ulid,
        last_maintenance: Option<Ms>,
        notes: Option<String>,
    ) -> Result<Bay, StoreError> {
        self.inner.update_bay_details(bay_id, last_maintenance, notes).await
    }

    async fn remove_bay(&self, bay_id: Ulid) -> Result<Bay, StoreError> {
        self.inner.remove_bay(bay_id).await
    }
}

fn flaky_harness(name: &str) -> (Workflow, Arc<Flaky>, Arc<Store>) {
    let store = open_store(name);
    let flaky = Arc::new(Flaky {
        inner: store.clone(),
        fail_status: AtomicBool::new(false),
        fail_vacate: AtomicBool::new(false),
    });
    let wf = Workflow::new(flaky.clone(), flaky.clone(), store.clone(), store.clone());
    (wf, flaky, store)
}

#[tokio::test]
async fn failed_second_assign_write_is_reported_and_retryable() {
    let (wf, flaky, store) = flaky_harness("partial_assign.wal");
    let s1 = tech("s1");
    let p = confirmed(&wf, &customer(), "13:45").await;
    let bay1 = bay(&wf, 1).await;

    flaky.fail_status.store(true, Ordering::SeqCst);
    let err = wf.bays.assign(&s1, bay1.id, p.id, None).await.unwrap_err();
    match &err {
        WorkflowError::PartialSuccess {
            committed, pending, ..
        } => {
            assert_eq!(committed, &vec![Write::Bay]);
            assert_eq!(pending, &vec![Write::Appointment]);
        }
        other => panic!("expected partial success, got {other:?}"),
    }
    assert!(!err.to_string().contains("fsync"));
    assert_eq!(store.get_bay(bay1.id).await.unwrap().current_booking, Some(p.id));
    assert_eq!(
        store.get_appointment(p.id).await.unwrap().status,
        AppointmentStatus::Confirmed
    );

    flaky.fail_status.store(false, Ordering::SeqCst);
    wf.bays.assign(&s1, bay1.id, p.id, None).await.unwrap();
    assert_eq!(
        store.get_appointment(p.id).await.unwrap().status,
        AppointmentStatus::InProgress
    );
}

#[tokio::test]
async fn failed_bay_release_after_completion_is_reported_and_retryable() {
    let (wf, flaky, store) = flaky_harness("partial_complete.wal");
    let s1 = tech("s1");
    let p = confirmed(&wf, &customer(), "14:15").await;
    let bay1 = bay(&wf, 1).await;
    wf.bays.assign(&s1, bay1.id, p.id, None).await.unwrap();
    let row = wf
        .progress
        .create(
            &s1,
            NewProgress {
                id: None,
                appointment_id: p.id,
                status: "testing".into(),
                notes: None,
                estimated_completion: None,
            },
        )
        .await
        .unwrap();
    let finish = ProgressUpdate {
        status: Some("completed".into()),
        free_bay: true,
        ..Default::default()
    };

    flaky.fail_vacate.store(true, Ordering::SeqCst);
    let err = wf.progress.update(&s1, row.id, finish.clone()).await.unwrap_err();
    match &err {
        WorkflowError::PartialSuccess {
            committed, pending, ..
        } => {
            assert_eq!(committed, &vec![Write::RepairProgress, Write::Appointment]);
            assert_eq!(pending, &vec![Write::Bay]);
        }
        other => panic!("expected partial success, got {other:?}"),
    }
    assert_eq!(
        store.get_appointment(p.id).await.unwrap().status,
        AppointmentStatus::Completed
    );
    assert_eq!(store.get_bay(bay1.id).await.unwrap().status, BayStatus::Occupied);

    flaky.fail_vacate.store(false, Ordering::SeqCst);
    wf.progress.update(&s1, row.id, finish).await.unwrap();
    assert_eq!(store.get_bay(bay1.id).await.unwrap().status, BayStatus::Available);
}
