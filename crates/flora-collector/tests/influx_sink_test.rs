use flora_collector::InfluxSink;
use flora_core::{DeviceIdentity, InfluxConfig, Measurement, Readings, Sink, SinkError};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> InfluxConfig {
    InfluxConfig {
        addr: server.uri(),
        ..InfluxConfig::default()
    }
}

fn measurement() -> Measurement {
    Measurement::now(
        &DeviceIdentity::new("C4:7C:8D:6A:12:34", "Flower care"),
        Some("Ficus"),
        Readings {
            firmware_version: "3.2.1".into(),
            battery_level: 87,
            temperature: 20.6,
            moisture: 40,
            light: 400,
            conductivity: 232,
        },
    )
}

#[tokio::test]
async fn test_write_posts_line_protocol() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/write"))
        .and(query_param("db", "flora"))
        .and(query_param("precision", "s"))
        .and(body_string_contains(
            "PlantSensors,mac=C4:7C:8D:6A:12:34,alias=Ficus,version=3.2.1 battery=87i,",
        ))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let sink = InfluxSink::new(&config(&server)).unwrap();
    sink.write(&measurement()).await.unwrap();
}

#[tokio::test]
async fn test_write_uses_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/write"))
        .and(header("authorization", "Basic ZmxvcmE6c2VjcmV0"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let sink = InfluxSink::new(&InfluxConfig {
        username: Some("flora".into()),
        password: Some("secret".into()),
        ..config(&server)
    })
    .unwrap();
    sink.write(&measurement()).await.unwrap();
}

#[tokio::test]
async fn test_write_reports_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/write"))
        .respond_with(
            ResponseTemplate::new(404).set_body_string("{\"error\":\"database not found: \\\"flora\\\"\"}\n"),
        )
        .mount(&server)
        .await;

    let sink = InfluxSink::new(&config(&server)).unwrap();
    let err = sink.write(&measurement()).await.unwrap_err();

    let SinkError::Rejected { status, body } = err else {
        panic!("expected rejection");
    };
    assert_eq!(status, 404);
    assert!(body.contains("database not found"));
}

#[tokio::test]
async fn test_write_reports_unreachable_server() {
    // nothing listens on the tcpmux port
    let sink = InfluxSink::new(&InfluxConfig {
        addr: "http://127.0.0.1:1".into(),
        ..InfluxConfig::default()
    })
    .unwrap();
    let err = sink.write(&measurement()).await.unwrap_err();

    assert!(matches!(err, SinkError::Request { .. }));
}

#[tokio::test]
async fn test_write_after_close_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let sink = InfluxSink::new(&config(&server)).unwrap();
    sink.close().await;

    assert!(matches!(
        sink.write(&measurement()).await,
        Err(SinkError::Closed)
    ));
}
