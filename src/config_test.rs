use super::*;

#[test]
fn client_payload_contains_endpoints_only() {
    let config = ServiceConfig {
        tcp_port: 4000,
        ws_port: 4001,
        file_service_url: Some("https://files.example.com".into()),
    };
    let payload = config.client_payload();
    assert_eq!(payload["tcp_port"], 4000);
    assert_eq!(payload["ws_port"], 4001);
    assert_eq!(payload["file_service_url"], "https://files.example.com");
}

#[test]
fn client_payload_null_file_service_when_unset() {
    let config = ServiceConfig { tcp_port: 1, ws_port: 2, file_service_url: None };
    assert!(config.client_payload()["file_service_url"].is_null());
}
