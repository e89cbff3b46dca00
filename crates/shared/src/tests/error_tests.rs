use super::*;

#[test]
fn timeout_keeps_its_bound_across_the_wire() {
    let api: ApiError = RelayError::Timeout(60).into();
    assert_eq!(api.error, ErrorKind::Timeout);

    let back = RelayError::from(api);
    assert_eq!(back, RelayError::Timeout(60));
    assert_eq!(back.to_string(), "confirmation not received within 60 seconds");
}

#[test]
fn other_kinds_keep_the_server_detail() {
    let back = RelayError::from(ApiError::new(
        ErrorKind::ConfirmationError,
        "device door3 is faulted",
    ));
    assert_eq!(
        back,
        RelayError::Confirmation("device door3 is faulted".to_string())
    );
    assert!(ErrorKind::SubmissionError.is_synchronous());
    assert!(!ErrorKind::Timeout.is_synchronous());
}
