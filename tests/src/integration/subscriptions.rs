//! # Subscription Scenarios
//!
//! Attach/detach bookkeeping against the daemon's match rules, and
//! per-observer delivery of broadcast signals.

#[cfg(test)]
mod tests {
    use crate::fixtures::{bridges, bridges_with, clock_tick, stub_bus, sys_version};
    use quadro_bus::domain::daemon;
    use quadro_bus::{BridgeConfig, InboundMessage, InboundSignal};
    use quadro_telemetry::{DAEMON_REQUEST_FAILURES, MESSAGES_DROPPED};
    use quadro_types::{
        BusKind, CallArguments, Endpoint, Notification, SubscriptionError, Variant,
    };
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn seconds(notification: &Notification) -> Option<i64> {
        notification.payload.get("0").and_then(Variant::as_i64)
    }

    fn tick_from(service: &str) -> Endpoint {
        Endpoint::new(service, "/Clock", "org.example.Clock", "Tick")
    }

    // =========================================================================
    // SCENARIOS
    // =========================================================================

    #[test]
    fn test_clock_tick_reaches_ui_observer() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let session = bridges.session();
        let mut notifications = session.notifications_for("ui-1");

        session.attach(&clock_tick(), "ui-1").unwrap();
        bus.emit_from(&clock_tick(), vec![Variant::Int(42)]);
        bus.emit_from(&clock_tick(), vec![Variant::Int(43)]);

        let first = notifications.blocking_recv().unwrap();
        assert_eq!(first.bus, BusKind::Session);
        assert_eq!(first.observer_id, "ui-1");
        assert_eq!(first.endpoint, clock_tick());
        assert_eq!(first.payload.len(), 1);
        assert_eq!(first.payload.get("0"), Some(&Variant::Int(42)));

        // Exactly one notification per inbound message
        let second = notifications.blocking_recv().unwrap();
        assert_eq!(seconds(&second), Some(43));
    }

    #[test]
    fn test_clock_tick_json_for_web_view() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let mut notifications = bridges.session().notifications_for("ui-1");

        bridges.session().attach(&clock_tick(), "ui-1").unwrap();
        bus.emit(
            InboundSignal::from_endpoint(&clock_tick(), vec![Variant::Int(42)])
                .with_names(vec!["seconds".into()]),
        );

        let notification = notifications.blocking_recv().unwrap();
        let json = notification.to_json().unwrap();
        assert!(json.contains("\"seconds\""));
        assert!(json.contains("42"));
        assert!(json.contains("ui-1"));
    }

    // =========================================================================
    // ATTACH / DETACH
    // =========================================================================

    #[test]
    fn test_double_attach_registers_once() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let session = bridges.session();

        session.attach(&clock_tick(), "ui-1").unwrap();
        session.attach(&clock_tick(), "ui-1").unwrap();

        assert_eq!(bus.add_match_requests(), 1);
        assert_eq!(bus.match_rules().len(), 1);
        assert_eq!(session.subscriptions().len(), 1);
        assert_eq!(session.subscriptions()[0].observers.len(), 1);
    }

    #[test]
    fn test_detach_of_unknown_pair_changes_nothing() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let session = bridges.session();
        session.attach(&clock_tick(), "ui-1").unwrap();
        let before = session.subscriptions();

        assert!(session.detach(&clock_tick(), "ghost").is_ok());
        let elsewhere = Endpoint::new("org.example.Net", "/Net", "org.example.Net", "Changed");
        assert!(session.detach(&elsewhere, "ui-1").is_ok());

        assert_eq!(session.subscriptions(), before);
        assert_eq!(bus.remove_match_requests(), 0);
        assert_eq!(bus.match_count(), 1);
    }

    #[test]
    fn test_two_observers_each_get_one_notification() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let session = bridges.session();
        let mut notifications = session.notifications();

        session.attach(&clock_tick(), "ui-1").unwrap();
        session.attach(&clock_tick(), "ui-2").unwrap();
        assert_eq!(bus.add_match_requests(), 1);

        bus.emit_from(&clock_tick(), vec![Variant::Int(42)]);
        bus.emit_from(&clock_tick(), vec![Variant::Int(43)]);

        let observers: BTreeSet<String> = (0..2)
            .map(|_| notifications.blocking_recv().unwrap())
            .inspect(|n| assert_eq!(seconds(n), Some(42)))
            .map(|n| n.observer_id)
            .collect();
        assert_eq!(
            observers,
            BTreeSet::from(["ui-1".to_string(), "ui-2".to_string()])
        );

        let next = notifications.blocking_recv().unwrap();
        assert_eq!(seconds(&next), Some(43));
    }

    #[test]
    fn test_partial_detach_keeps_match_and_other_observer() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let session = bridges.session();
        let mut notifications = session.notifications();

        session.attach(&clock_tick(), "ui-1").unwrap();
        session.attach(&clock_tick(), "ui-2").unwrap();
        session.detach(&clock_tick(), "ui-1").unwrap();

        assert_eq!(bus.match_count(), 1);
        assert_eq!(bus.remove_match_requests(), 0);

        bus.emit_from(&clock_tick(), vec![Variant::Int(1)]);
        bus.emit_from(&clock_tick(), vec![Variant::Int(2)]);

        for expected in [1, 2] {
            let notification = notifications.blocking_recv().unwrap();
            assert_eq!(notification.observer_id, "ui-2");
            assert_eq!(seconds(&notification), Some(expected));
        }
    }

    #[test]
    fn test_last_detach_releases_match_until_reattached() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let session = bridges.session();

        session.attach(&clock_tick(), "ui-1").unwrap();
        session.detach(&clock_tick(), "ui-1").unwrap();

        assert_eq!(bus.match_count(), 0);
        assert_eq!(bus.remove_match_requests(), 1);
        assert!(session.subscriptions().is_empty());
        assert_eq!(bus.emit_from(&clock_tick(), vec![Variant::Int(1)]), 0);

        let mut notifications = session.notifications_for("ui-1");
        session.attach(&clock_tick(), "ui-1").unwrap();
        assert_eq!(bus.match_count(), 1);
        assert_eq!(bus.add_match_requests(), 2);

        assert_eq!(bus.emit_from(&clock_tick(), vec![Variant::Int(2)]), 1);
        let notification = notifications.blocking_recv().unwrap();
        assert_eq!(seconds(&notification), Some(2));
    }

    #[tokio::test]
    async fn test_detached_observer_hears_nothing_more() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let signals = bridges.session().signals().clone();
        let mut notifications = signals.notifications_for("ui-1");

        signals.attach_async(&clock_tick(), "ui-1").await.unwrap();
        signals.detach_async(&clock_tick(), "ui-1").await.unwrap();
        bus.emit_from(&clock_tick(), vec![Variant::Int(7)]);

        let nothing = tokio::time::timeout(Duration::from_millis(50), notifications.recv()).await;
        assert!(nothing.is_err());
    }

    #[test]
    fn test_any_sender_subscription_matches_every_service() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let session = bridges.session();
        let any_tick = Endpoint::any_sender("/Clock", "org.example.Clock", "Tick");
        let mut notifications = session.notifications_for("ui-1");

        session.attach(&any_tick, "ui-1").unwrap();
        assert!(!bus.match_rules()[0].contains("sender="));

        let other = Endpoint::new("org.example.OtherClock", "/Clock", "org.example.Clock", "Tick");
        bus.emit_from(&other, vec![Variant::Int(5)]);

        let notification = notifications.blocking_recv().unwrap();
        assert_eq!(notification.endpoint, any_tick);
        assert_eq!(seconds(&notification), Some(5));
    }

    #[test]
    fn test_endpoints_do_not_cross_deliver() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let session = bridges.session();
        let net = Endpoint::new("org.example.Net", "/Net", "org.example.Net", "Changed");
        let mut notifications = session.notifications();

        session.attach(&clock_tick(), "clock-view").unwrap();
        session.attach(&net, "net-view").unwrap();

        bus.emit_from(&net, vec![Variant::from("online")]);
        let notification = notifications.blocking_recv().unwrap();
        assert_eq!(notification.observer_id, "net-view");
        assert_eq!(notification.payload.get("0"), Some(&Variant::from("online")));
    }

    // =========================================================================
    // UNIQUE SENDER NAMES
    // =========================================================================

    #[test]
    fn test_same_member_on_two_services_stays_apart() {
        let bus = stub_bus();
        bus.set_unique_senders(true);
        bus.claim_name("org.example.A");
        bus.claim_name("org.example.B");
        let bridges = bridges(&bus);
        let session = bridges.session();
        let mut notifications = session.notifications();

        session.attach(&tick_from("org.example.A"), "watch-a").unwrap();
        session.attach(&tick_from("org.example.B"), "watch-b").unwrap();
        let watches = bus
            .match_rules()
            .into_iter()
            .filter(|rule| rule.contains(daemon::NAME_OWNER_CHANGED))
            .count();
        assert_eq!(watches, 1);

        bus.emit_from(&tick_from("org.example.A"), vec![Variant::Int(1)]);
        bus.emit_from(&tick_from("org.example.B"), vec![Variant::Int(2)]);

        let first = notifications.blocking_recv().unwrap();
        assert_eq!(first.observer_id, "watch-a");
        assert_eq!(seconds(&first), Some(1));
        let second = notifications.blocking_recv().unwrap();
        assert_eq!(second.observer_id, "watch-b");
        assert_eq!(seconds(&second), Some(2));
        assert_eq!(notifications.try_recv(), Ok(None));
    }

    #[test]
    fn test_subscription_follows_name_to_new_owner() {
        let bus = stub_bus();
        bus.set_unique_senders(true);
        let bridges = bridges(&bus);
        let session = bridges.session();
        let mut notifications = session.notifications_for("ui-1");

        // Nobody owns the name yet
        session.attach(&clock_tick(), "ui-1").unwrap();

        let first_owner = bus.claim_name("org.example.Clock");
        bus.emit_from(&clock_tick(), vec![Variant::Int(1)]);
        assert_eq!(seconds(&notifications.blocking_recv().unwrap()), Some(1));

        let second_owner = bus.claim_name("org.example.Clock");
        assert_ne!(first_owner, second_owner);
        bus.inject(Ok(InboundMessage::Signal(InboundSignal::new(
            Some(first_owner),
            "/Clock",
            "org.example.Clock",
            "Tick",
            vec![Variant::Int(2)],
        ))));
        bus.emit_from(&clock_tick(), vec![Variant::Int(3)]);

        assert_eq!(seconds(&notifications.blocking_recv().unwrap()), Some(3));
    }

    // =========================================================================
    // SLOW RECEIVERS
    // =========================================================================

    #[test]
    fn test_slow_observer_loses_nothing() {
        let bus = stub_bus();
        let config = BridgeConfig::for_testing().with_notification_capacity(4);
        let bridges = bridges_with(&bus, config);
        let session = bridges.session();
        let mut ui = session.notifications_for("ui-1");
        let mut tap = session.notifications();
        let lagged = MESSAGES_DROPPED.with_label_values(&["session", "lagged"]);
        let before = lagged.get();

        session.attach(&clock_tick(), "ui-1").unwrap();
        for value in 0..10 {
            bus.emit_from(&clock_tick(), vec![Variant::Int(value)]);
        }

        let received: Vec<i64> = (0..10)
            .map(|_| seconds(&ui.blocking_recv().unwrap()).unwrap())
            .collect();
        assert_eq!(received, (0..10).collect::<Vec<_>>());

        // The bounded tap keeps the newest four and counts the rest
        let oldest_kept = tap.try_recv().unwrap().unwrap();
        assert_eq!(seconds(&oldest_kept), Some(6));
        assert!(lagged.get() >= before + 6);
    }

    // =========================================================================
    // FAILURES
    // =========================================================================

    #[test]
    fn test_rejected_match_leaves_no_subscription() {
        let bus = stub_bus();
        bus.set_reject_matches(Some(daemon::ERROR_ACCESS_DENIED));
        let bridges = bridges(&bus);

        let result = bridges.session().attach(&clock_tick(), "ui-1");

        assert!(matches!(
            result,
            Err(SubscriptionError::Rejected { ref name, .. }) if name == daemon::ERROR_ACCESS_DENIED
        ));
        assert!(bridges.session().subscriptions().is_empty());
        assert_eq!(bus.match_count(), 0);
    }

    #[test]
    fn test_refused_removal_still_detaches() {
        let bus = stub_bus();
        bus.set_reject_removals(Some(daemon::ERROR_ACCESS_DENIED));
        let bridges = bridges(&bus);
        let session = bridges.session();
        let failures = DAEMON_REQUEST_FAILURES.with_label_values(&["session", "remove"]);
        let before = failures.get();

        session.attach(&clock_tick(), "ui-1").unwrap();
        assert_eq!(session.detach(&clock_tick(), "ui-1"), Ok(()));
        assert!(session.subscriptions().is_empty());

        // The daemon kept the rule, so the signal still reaches the connection
        let mut notifications = session.notifications_for("ui-1");
        assert_eq!(bus.emit_from(&clock_tick(), vec![Variant::Int(1)]), 1);

        // The call's reply queues behind the refusal and the signal
        assert!(session.call(&sys_version(), &CallArguments::new()).is_ok());
        assert_eq!(notifications.try_recv(), Ok(None));
        assert!(failures.get() > before);
    }

    // =========================================================================
    // IN-FLIGHT MATCH REQUESTS
    // =========================================================================

    #[tokio::test]
    async fn test_attaches_during_pending_match_share_one_request() {
        let bus = stub_bus();
        bus.hold_daemon_replies();
        let bridges = bridges(&bus);
        let signals = bridges.session().signals().clone();

        let (tick_1, tick_2) = (clock_tick(), clock_tick());
        let (first, second, ()) = tokio::join!(
            signals.attach_async(&tick_1, "ui-1"),
            signals.attach_async(&tick_2, "ui-2"),
            async {
                // Queued behind both attaches
                assert!(signals.subscriptions().is_empty());
                bus.release_daemon_replies();
            },
        );

        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(bus.add_match_requests(), 1);
        assert_eq!(bus.match_count(), 1);
        assert_eq!(
            signals.subscriptions()[0].observers,
            vec!["ui-1".to_string(), "ui-2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unanswered_match_times_out_every_waiter() {
        let bus = stub_bus();
        bus.hold_daemon_replies();
        let bridges = bridges(&bus);
        let signals = bridges.session().signals().clone();
        let timeout = bridges.session().handle().config().subscribe_timeout;

        let (tick_1, tick_2) = (clock_tick(), clock_tick());
        let (first, second) = tokio::join!(
            signals.attach_async(&tick_1, "ui-1"),
            signals.attach_async(&tick_2, "ui-2"),
        );

        assert_eq!(first, Err(SubscriptionError::Timeout(timeout)));
        assert_eq!(second, Err(SubscriptionError::Timeout(timeout)));
        assert_eq!(bus.add_match_requests(), 1);
        assert!(signals.subscriptions().is_empty());

        // A late acceptance is cancelled; the next attach asks again
        bus.release_daemon_replies();
        assert_eq!(bus.remove_match_requests(), 1);
        assert_eq!(bus.match_count(), 0);

        signals.attach_async(&clock_tick(), "ui-1").await.unwrap();
        assert_eq!(bus.add_match_requests(), 2);
        assert_eq!(bus.match_count(), 1);
    }

    #[tokio::test]
    async fn test_detach_during_pending_attach_withdraws_the_observer() {
        let bus = stub_bus();
        bus.hold_daemon_replies();
        let bridges = bridges(&bus);
        let signals = bridges.session().signals().clone();
        let mut notifications = signals.notifications_for("ui-1");

        let tick = clock_tick();
        let (attached, detached) = tokio::join!(
            signals.attach_async(&tick, "ui-1"),
            async {
                while bus.add_match_requests() == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                let detached = signals.detach_async(&clock_tick(), "ui-1").await;
                bus.release_daemon_replies();
                detached
            },
        );

        assert_eq!(attached, Ok(()));
        assert_eq!(detached, Ok(()));
        assert!(signals.subscriptions().is_empty());
        assert_eq!(bus.remove_match_requests(), 1);
        assert_eq!(bus.match_count(), 0);
        assert_eq!(bus.emit_from(&clock_tick(), vec![Variant::Int(1)]), 0);
        assert_eq!(notifications.try_recv(), Ok(None));
    }

    #[test]
    fn test_malformed_signal_is_dropped_and_delivery_continues() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let session = bridges.session();
        let mut notifications = session.notifications_for("ui-1");
        session.attach(&clock_tick(), "ui-1").unwrap();

        bus.emit(
            InboundSignal::from_endpoint(&clock_tick(), vec![Variant::Int(1), Variant::Int(2)])
                .with_names(vec!["dup".into(), "dup".into()]),
        );
        bus.emit_from(&clock_tick(), vec![Variant::Int(3)]);

        let notification = notifications.blocking_recv().unwrap();
        assert_eq!(seconds(&notification), Some(3));
        assert!(session.is_valid());
    }
}
