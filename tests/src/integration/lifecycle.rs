//! # Connection Lifecycle Scenarios
//!
//! Startup with an unreachable bus, loss of a live connection, shutdown, and
//! the metrics the bridge leaves behind.

#[cfg(test)]
mod tests {
    use crate::fixtures::{bridges, clock_tick, stub_bus, sys_version};
    use quadro_bus::{BridgeConfig, BusBridges, TransportError};
    use quadro_types::{
        BusKind, CallArguments, CallError, CallResult, Endpoint, SubscriptionError, Variant,
    };
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_unreachable_system_bus_degrades_only_that_bus() {
        let bus = stub_bus();
        bus.set_reachable(BusKind::System, false);
        let bridges = bridges(&bus);

        let system = bridges.system();
        assert!(!system.is_valid());
        assert_eq!(
            system.call(&sys_version(), &CallArguments::new()),
            CallResult::Failed(CallError::ConnectionInvalid)
        );
        assert_eq!(
            system.attach(&clock_tick(), "ui-1"),
            Err(SubscriptionError::ConnectionInvalid)
        );
        assert_eq!(
            system.detach(&clock_tick(), "ui-1"),
            Err(SubscriptionError::ConnectionInvalid)
        );

        assert!(bridges.session().is_valid());
        assert_eq!(
            bridges.session().call(&sys_version(), &CallArguments::new()),
            CallResult::Value(Variant::from("1.0"))
        );
        assert_eq!(bus.connections(), 1);
    }

    #[test]
    fn test_invalid_handle_fails_fast() {
        let bus = stub_bus();
        bus.set_reachable(BusKind::Session, false);
        let bridges = bridges(&bus);

        let start = Instant::now();
        let result = bridges.session().call_with_timeout(
            &sys_version(),
            &CallArguments::new(),
            Duration::from_secs(30),
        );

        assert_eq!(result, CallResult::Failed(CallError::ConnectionInvalid));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_lost_connection_resolves_pending_call_and_stays_invalid() {
        let bus = stub_bus();
        let silent = Endpoint::new("org.example.Slow", "/Slow", "org.example.Slow", "Wait");
        bus.register_silent(&silent);
        let bridges = bridges(&bus);
        let session = bridges.session().clone();
        let mut notifications = session.notifications();

        let caller = thread::spawn(move || {
            session.call_with_timeout(&silent, &CallArguments::new(), Duration::from_secs(30))
        });
        assert!(wait_until(|| !bus.sent_calls().is_empty()));

        bus.disconnect_all();

        assert_eq!(
            caller.join().unwrap(),
            CallResult::Failed(CallError::ConnectionInvalid)
        );
        assert!(wait_until(|| !bridges.session().is_valid()));
        assert!(notifications.blocking_recv().is_none());

        // No reconnection, even once the daemon is back
        assert_eq!(
            bridges.session().call(&sys_version(), &CallArguments::new()),
            CallResult::Failed(CallError::ConnectionInvalid)
        );
    }

    #[test]
    fn test_transport_failure_invalidates_handle() {
        let bus = stub_bus();
        let bridges = bridges(&bus);

        bus.inject(Err(TransportError::Io("connection reset".into())));

        assert!(wait_until(|| !bridges.system().is_valid()));
        assert!(wait_until(|| !bridges.session().is_valid()));
    }

    #[test]
    fn test_undecodable_message_is_not_fatal() {
        let bus = stub_bus();
        let bridges = bridges(&bus);

        bus.inject(Err(TransportError::Decode("bad body".into())));

        assert_eq!(
            bridges.session().call(&sys_version(), &CallArguments::new()),
            CallResult::Value(Variant::from("1.0"))
        );
    }

    #[test]
    fn test_shutdown_closes_both_connections() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        bridges.session().attach(&clock_tick(), "ui-1").unwrap();
        assert_eq!(bus.connections(), 2);
        assert_eq!(bus.match_count(), 1);

        drop(bridges);

        assert_eq!(bus.connections(), 0);
        assert_eq!(bus.match_count(), 0);
    }

    #[test]
    fn test_config_reaches_both_handles() {
        let bus = stub_bus();
        let config = BridgeConfig::default().with_call_timeout(Duration::from_millis(200));
        let bridges = BusBridges::connect(Arc::new(bus), config);

        for bridge in [bridges.system(), bridges.session()] {
            assert_eq!(
                bridge.handle().config().call_timeout,
                Duration::from_millis(200)
            );
        }
    }

    #[test]
    fn test_metrics_record_bridge_traffic() {
        let handle = quadro_telemetry::register_metrics().unwrap();
        assert_eq!(handle.registered(), 7);

        let bus = stub_bus();
        let bridges = bridges(&bus);
        let mut notifications = bridges.session().notifications();
        assert!(bridges.session().call(&sys_version(), &CallArguments::new()).is_ok());
        bridges.session().attach(&clock_tick(), "ui-1").unwrap();
        bus.emit_from(&clock_tick(), vec![Variant::Int(1)]);
        notifications.blocking_recv().unwrap();

        let text = quadro_telemetry::encode_metrics().unwrap();
        assert!(text.contains("quadro_bus_calls_total"));
        assert!(text.contains("outcome=\"ok\""));
        assert!(text.contains("quadro_bus_signals_received_total"));
        assert!(text.contains("quadro_bus_notifications_delivered_total"));
        assert!(text.contains("quadro_bus_active_matches"));
    }
}
