use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use advent_core::calendar::CalendarStore;
use advent_core::claim::{ClaimError, SlotClaimer};
use advent_core::commands::App;
use advent_core::datastore::JsonlStore;
use advent_core::entry::{ClaimPayload, Identity, ProviderTag};
use advent_core::identity::{LocalIdentityProvider, Profile};
use advent_core::notify::LogNotifier;
use tempfile::tempdir;

fn identity(id: &str, name: Option<&str>) -> Identity {
    Identity {
        id: id.to_string(),
        display_name: name.map(str::to_string),
        avatar_url: None,
        provider: ProviderTag::Github,
    }
}

fn payload(title: &str, url: &str) -> ClaimPayload {
    ClaimPayload {
        title: title.to_string(),
        url: url.to_string(),
        comment: None,
    }
}

#[test]
fn two_claimants_race_for_one_day() {
    let temp = tempdir().expect("tempdir");
    let first = JsonlStore::open(temp.path()).expect("open store");
    let second = JsonlStore::open(temp.path()).expect("open second handle");
    let alice = identity("alice", Some("Alice"));
    let bob = identity("bob", Some("Bob"));

    let (a, b) = thread::scope(|scope| {
        let a = scope.spawn(|| {
            SlotClaimer::new(&first, 2025).claim(
                2025,
                12,
                Some(&alice),
                &payload("Alice on day 12", "https://alice.example/12"),
            )
        });
        let b = scope.spawn(|| {
            SlotClaimer::new(&second, 2025).claim(
                2025,
                12,
                Some(&bob),
                &payload("Bob on day 12", "https://bob.example/12"),
            )
        });
        (
            a.join().expect("alice thread"),
            b.join().expect("bob thread"),
        )
    });

    let (winner, loser) = match (a, b) {
        (Ok(entry), Err(err)) | (Err(err), Ok(entry)) => (entry, err),
        other => panic!("exactly one claim must win, got {other:?}"),
    };
    match loser {
        ClaimError::SlotTaken {
            owner_id,
            owner_name,
            ..
        } => {
            assert_eq!(owner_id, winner.owner_id);
            assert_eq!(owner_name, winner.owner_display_name);
        }
        other => panic!("expected SlotTaken, got {other:?}"),
    }

    let stored = first.load_all().expect("load");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].user_id, winner.owner_id);
}

#[test]
fn many_claimants_leave_one_entry_per_day() {
    let temp = tempdir().expect("tempdir");
    let store = JsonlStore::open(temp.path()).expect("open store");
    let claimants: Vec<Identity> = (0..8)
        .map(|n| identity(&format!("user-{n}"), None))
        .collect();

    thread::scope(|scope| {
        for (n, who) in claimants.iter().enumerate() {
            let store = &store;
            scope.spawn(move || {
                for day in [1_u32, 2, 3] {
                    let _ = SlotClaimer::new(store, 2025).claim(
                        2025,
                        day,
                        Some(who),
                        &payload(&format!("post {n}"), &format!("https://example.com/{n}/{day}")),
                    );
                }
            });
        }
    });

    let records = store.load_all().expect("load");
    assert_eq!(records.len(), 3);
    let mut ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["2025-1", "2025-2", "2025-3"]);
    assert!(records.iter().all(|r| r.user_name == "Anonymous"));
}

#[test]
fn refresh_shows_only_claimed_days() {
    let temp = tempdir().expect("tempdir");
    let store = JsonlStore::open(temp.path()).expect("open store");
    let alice = identity("alice", Some("Alice"));

    for day in [3, 10] {
        SlotClaimer::new(&store, 2025)
            .claim(
                2025,
                day,
                Some(&alice),
                &payload(&format!("day {day}"), "https://example.com/"),
            )
            .expect("claim");
    }

    let calendar = CalendarStore::new(store, 2025);
    let mut updates = calendar.subscribe();
    assert!(calendar.snapshot().is_loading());

    let snapshot = calendar.refresh(2025).expect("refresh");
    assert!(updates.has_changed().expect("sender alive"));
    assert!(!snapshot.is_loading());

    let populated: Vec<u32> = (1..=25).filter(|&d| snapshot.get(d).is_some()).collect();
    assert_eq!(populated, vec![3, 10]);
    assert_eq!(updates.borrow_and_update().len(), 2);
}

#[test]
fn session_survives_restart_and_feeds_claims() {
    let temp = tempdir().expect("tempdir");
    let profiles = BTreeMap::from([(
        ProviderTag::Google,
        Profile {
            identity: Identity {
                id: "g-1".to_string(),
                display_name: Some("Hana".to_string()),
                avatar_url: Some("https://avatars.example/hana.png".to_string()),
                provider: ProviderTag::Google,
            },
            email: Some("hana@example.com".to_string()),
        },
    )]);

    let open_app = || {
        App::new(
            2025,
            JsonlStore::open(temp.path()).expect("open store"),
            LocalIdentityProvider::new(temp.path(), profiles.clone()).assume_yes(true),
            Arc::new(LogNotifier),
        )
    };

    let first = open_app();
    first.session.sign_in(ProviderTag::Google);
    assert!(first.session.is_authenticated());

    let second = open_app();
    assert!(!second.session.is_authenticated());
    second.session.restore();
    let hana = second.session.current_identity().expect("restored identity");

    let entry = SlotClaimer::new(second.calendar.store(), second.year)
        .claim(
            2025,
            24,
            Some(&hana),
            &payload("Christmas Eve", "https://example.com/eve"),
        )
        .expect("claim");
    assert_eq!(entry.owner_avatar_url.as_deref(), Some("https://avatars.example/hana.png"));

    second.session.sign_out();
    let third = open_app();
    third.session.restore();
    assert_eq!(third.session.current_identity(), None);
}
