//! # Remote Call Scenarios
//!
//! Every call yields exactly one value or exactly one categorized failure,
//! within its timeout.

#[cfg(test)]
mod tests {
    use crate::fixtures::{bridges, echo, stub_bus, sys_version};
    use quadro_bus::domain::daemon;
    use quadro_types::{
        CallArguments, CallError, CallResult, Endpoint, MalformedArguments, Variant, MAX_CALL_ARGS,
    };
    use std::time::{Duration, Instant};

    // =========================================================================
    // VALUES
    // =========================================================================

    #[test]
    fn test_sys_version_returns_single_value() {
        let bus = stub_bus();
        let bridges = bridges(&bus);

        let result = bridges.session().call_with_timeout(
            &sys_version(),
            &CallArguments::new(),
            Duration::from_secs(2),
        );

        assert_eq!(result, CallResult::Value(Variant::from("1.0")));
        assert!(result.error().is_none());
    }

    #[test]
    fn test_eight_arguments_arrive_in_order() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let args = CallArguments::from_values(0..MAX_CALL_ARGS as i64).unwrap();

        let result = bridges.session().call(&echo(), &args);

        let expected: Vec<Variant> = (0..MAX_CALL_ARGS as i64).map(Variant::Int).collect();
        assert_eq!(result, CallResult::Value(Variant::List(expected)));
    }

    #[test]
    fn test_trailing_absent_arguments_are_not_sent() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let args = CallArguments::from_values(vec![
            Variant::from("a"),
            Variant::Empty,
            Variant::Empty,
        ])
        .unwrap();

        let result = bridges.session().call(&echo(), &args);

        assert_eq!(
            result,
            CallResult::Value(Variant::List(vec![Variant::from("a")]))
        );
    }

    #[test]
    fn test_system_and_session_are_independent() {
        let bus = stub_bus();
        let bridges = bridges(&bus);

        assert!(bridges.system().call(&sys_version(), &CallArguments::new()).is_ok());
        assert!(bridges.session().call(&sys_version(), &CallArguments::new()).is_ok());
        assert_eq!(bus.connections(), 2);
    }

    // =========================================================================
    // FAILURES
    // =========================================================================

    #[test]
    fn test_unknown_service_fails_within_timeout() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let missing = Endpoint::new("org.example.Missing", "/Missing", "org.example.Missing", "Get");
        let timeout = Duration::from_secs(2);

        let start = Instant::now();
        let result = bridges
            .session()
            .call_with_timeout(&missing, &CallArguments::new(), timeout);

        assert!(start.elapsed() < timeout);
        assert!(matches!(
            result,
            CallResult::Failed(CallError::Remote { ref name, .. }) if name == daemon::ERROR_SERVICE_UNKNOWN
        ));
    }

    #[test]
    fn test_silent_service_times_out_instead_of_hanging() {
        let bus = stub_bus();
        let silent = Endpoint::new("org.example.Slow", "/Slow", "org.example.Slow", "Wait");
        bus.register_silent(&silent);
        let bridges = bridges(&bus);
        let timeout = Duration::from_millis(100);

        let start = Instant::now();
        let result = bridges
            .session()
            .call_with_timeout(&silent, &CallArguments::new(), timeout);

        assert_eq!(result, CallResult::Failed(CallError::Timeout(timeout)));
        assert!(start.elapsed() >= timeout);
        assert!(start.elapsed() < Duration::from_secs(2));

        // The handle survives a timeout
        assert!(bridges.session().call(&sys_version(), &CallArguments::new()).is_ok());
    }

    #[test]
    fn test_remote_error_carries_name_and_message() {
        let bus = stub_bus();
        let failing = Endpoint::new("org.example.Fail", "/Fail", "org.example.Fail", "Now");
        bus.register_method(&failing, |_| {
            Err((
                "org.example.Error.Busy".to_string(),
                Some("try later".to_string()),
            ))
        });
        let bridges = bridges(&bus);

        let result = bridges.session().call(&failing, &CallArguments::new());

        assert_eq!(
            result.into_result(),
            Err(CallError::Remote {
                name: "org.example.Error.Busy".into(),
                message: Some("try later".into()),
            })
        );
    }

    #[test]
    fn test_gap_in_arguments_rejected_before_sending() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let args =
            CallArguments::from_values(vec![Variant::Int(1), Variant::Empty, Variant::Int(3)])
                .unwrap();

        let result = bridges.session().call(&echo(), &args);

        assert_eq!(
            result,
            CallResult::Failed(CallError::Malformed(MalformedArguments::AbsentArgument {
                position: 1
            }))
        );
        assert!(bus.sent_calls().is_empty());
    }

    #[test]
    fn test_ninth_argument_is_refused_at_the_boundary() {
        let mut args = CallArguments::from_values(vec![Variant::Bool(true); MAX_CALL_ARGS]).unwrap();

        assert!(matches!(
            args.push(false),
            Err(MalformedArguments::TooManyArguments { max, .. }) if max == MAX_CALL_ARGS
        ));
        assert_eq!(args.len(), MAX_CALL_ARGS);
    }

    #[test]
    fn test_wildcard_service_cannot_be_called() {
        let bus = stub_bus();
        let bridges = bridges(&bus);
        let wildcard = Endpoint::any_sender("/Sys", "org.example.Sys", "Version");

        let result = bridges.session().call(&wildcard, &CallArguments::new());

        assert_eq!(
            result,
            CallResult::Failed(CallError::Malformed(MalformedArguments::WildcardDestination))
        );
    }

    #[tokio::test]
    async fn test_concurrent_async_calls_resolve_independently() {
        let bus = stub_bus();
        let silent = Endpoint::new("org.example.Slow", "/Slow", "org.example.Slow", "Wait");
        bus.register_silent(&silent);
        let bridges = bridges(&bus);
        let calls = bridges.session().calls().clone();
        let no_args = CallArguments::new();
        let version = sys_version();

        let (slow, fast) = tokio::join!(
            calls.call_async(&silent, &no_args, Duration::from_millis(100)),
            calls.call_async(&version, &no_args, Duration::from_secs(2)),
        );

        assert_eq!(fast, CallResult::Value(Variant::from("1.0")));
        assert_eq!(
            slow,
            CallResult::Failed(CallError::Timeout(Duration::from_millis(100)))
        );
    }
}
