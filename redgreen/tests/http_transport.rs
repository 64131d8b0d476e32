//! HTTP transport and resilient client against a local mock server.

use std::net::TcpListener;
use std::time::Duration;

use mockito::Matcher;
use redgreen::core::backoff::{CircuitBreaker, CircuitState, RetryPolicy};
use redgreen::error::CycleError;
use redgreen::io::consult::{
    CallError, GenerateRequest, GenerateTransport, HttpTransport, ResilientClient,
};
use serde_json::json;

fn request(prompt: &str) -> GenerateRequest {
    GenerateRequest {
        model: "llama3".to_string(),
        prompt: prompt.to_string(),
        stream: false,
    }
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

#[test]
fn posts_generate_request_and_reads_response_field() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/api/generate")
        .match_body(Matcher::PartialJson(json!({
            "model": "llama3",
            "prompt": "why is the test red?",
            "stream": false,
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"model":"llama3","response":"sum is not exported","done":true}"#)
        .expect(1)
        .create();

    let transport = HttpTransport::new(&format!("{}/", server.url()), Duration::from_secs(5))
        .expect("transport");
    assert!(transport.endpoint().ends_with("/api/generate"));
    let text = transport
        .generate(&request("why is the test red?"))
        .expect("generate");
    assert_eq!(text, "sum is not exported");
    mock.assert();
}

#[test]
fn missing_response_field_is_invalid_and_not_retried() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/api/generate")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"model not loaded"}"#)
        .expect(2)
        .create();

    let transport = HttpTransport::new(&server.url(), Duration::from_secs(5)).expect("transport");
    let err = transport.generate(&request("x")).unwrap_err();
    assert!(matches!(err, CallError::InvalidResponse(_)));

    let mut client = ResilientClient::new(
        HttpTransport::new(&server.url(), Duration::from_secs(5)).expect("transport"),
        "llama3",
        fast_policy(3),
        CircuitBreaker::new(5, Duration::from_secs(30)),
    );
    // One attempt from the bare transport above, one from the client.
    assert!(matches!(client.generate("x"), Err(CycleError::Service(_))));
    mock.assert();
}

#[test]
fn server_errors_are_retried_client_errors_are_not() {
    let mut server = mockito::Server::new();
    let unavailable = server
        .mock("POST", "/api/generate")
        .match_body(Matcher::PartialJson(json!({ "prompt": "busy" })))
        .with_status(503)
        .with_body("overloaded")
        .expect(3)
        .create();
    let not_found = server
        .mock("POST", "/api/generate")
        .match_body(Matcher::PartialJson(json!({ "prompt": "missing model" })))
        .with_status(404)
        .with_body("model not found")
        .expect(1)
        .create();

    let mut client = ResilientClient::new(
        HttpTransport::new(&server.url(), Duration::from_secs(5)).expect("transport"),
        "llama3",
        fast_policy(3),
        CircuitBreaker::new(5, Duration::from_secs(30)),
    );
    let err = client.generate("busy").unwrap_err();
    assert!(err.to_string().contains("503"), "{err}");
    let err = client.generate("missing model").unwrap_err();
    assert!(err.to_string().contains("404"), "{err}");

    unavailable.assert();
    not_found.assert();
    assert_eq!(client.circuit_state(), CircuitState::Closed);
}

#[test]
fn refused_connections_open_the_circuit() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let transport = HttpTransport::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(2))
        .expect("transport");
    let err = transport.generate(&request("x")).unwrap_err();
    assert!(err.is_retryable(), "{err:?}");

    let mut client = ResilientClient::new(
        transport,
        "llama3",
        fast_policy(2),
        CircuitBreaker::new(2, Duration::from_secs(60)),
    );
    assert!(matches!(client.generate("a"), Err(CycleError::Service(_))));
    assert!(matches!(client.generate("b"), Err(CycleError::Service(_))));
    assert_eq!(client.circuit_state(), CircuitState::Open);
    assert!(matches!(
        client.generate("c"),
        Err(CycleError::ServiceUnavailable(_))
    ));
}
