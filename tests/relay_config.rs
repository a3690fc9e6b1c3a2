use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use camgate::config::RelayConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMGATE_CONFIG",
        "CAMGATE_FEED_ADDR",
        "CAMGATE_RECOGNITION_ADDR",
        "CAMGATE_RECOGNIZER_URL",
        "CAMGATE_CAMERA_URL",
        "CAMGATE_TARGET_FPS",
        "CAMGATE_TRANSCODER",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "cameras": [
            { "id": "Lab1", "label": "Robotics Lab", "url": "rtsp://user:pw@10.0.0.5:554/stream1" },
            { "id": "lab2", "url": "stub://lab2" }
        ],
        "source": {
            "target_fps": 8,
            "stall_timeout_secs": 4,
            "initial_backoff_ms": 250,
            "max_consecutive_failures": 3
        },
        "feed": { "addr": "127.0.0.1:4002", "queue_depth": 3 },
        "recognition": { "recognizer_url": "http://10.0.0.9:8001", "request_timeout_secs": 5 },
        "session": { "idle_timeout_secs": 0 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("CAMGATE_CONFIG", file.path());
    std::env::set_var("CAMGATE_RECOGNITION_ADDR", "127.0.0.1:6001");
    std::env::set_var("CAMGATE_TARGET_FPS", "12");

    let cfg = RelayConfig::load().expect("load config");

    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[0].id, "lab1");
    assert_eq!(cfg.cameras[0].label, "Robotics Lab");
    assert_eq!(cfg.cameras[1].label, "lab2");
    assert_eq!(cfg.source.target_fps, 12);
    assert_eq!(cfg.source.stall_timeout, Duration::from_secs(4));
    assert_eq!(cfg.source.initial_backoff, Duration::from_millis(250));
    assert_eq!(cfg.source.max_backoff, Duration::from_secs(30));
    assert_eq!(cfg.source.max_consecutive_failures, 3);
    assert_eq!(cfg.source.transcoder, "ffmpeg");
    assert_eq!(cfg.feed.addr, "127.0.0.1:4002");
    assert_eq!(cfg.feed.queue_depth, 3);
    assert_eq!(cfg.recognition.addr, "127.0.0.1:6001");
    assert_eq!(cfg.recognition.recognizer_url, "http://10.0.0.9:8001");
    assert_eq!(cfg.recognition.request_timeout, Duration::from_secs(5));
    assert!(cfg.recognition.probe_on_startup);
    assert_eq!(cfg.session.idle_timeout, Duration::ZERO);
    assert_eq!(cfg.session.ping_interval, Duration::from_secs(30));

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[[cameras]]
id = "lab1"
label = "Chemistry Lab"
url = "stub://lab1"

[recognition]
probe_on_startup = false

[log]
health_interval_secs = 0
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = RelayConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.cameras.len(), 1);
    assert_eq!(cfg.cameras[0].label, "Chemistry Lab");
    assert!(!cfg.recognition.probe_on_startup);
    assert_eq!(cfg.health_interval, Duration::ZERO);
    assert_eq!(cfg.feed.addr, "0.0.0.0:3002");

    clear_env();
}

#[test]
fn camera_url_env_overrides_default_camera() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMGATE_CAMERA_URL", "rtsp://10.0.0.7/live");
    std::env::set_var("CAMGATE_TRANSCODER", "/usr/local/bin/ffmpeg");
    let cfg = RelayConfig::load().expect("load config");
    assert_eq!(cfg.cameras.len(), 1);
    assert_eq!(cfg.cameras[0].id, "default");
    assert_eq!(cfg.cameras[0].url, "rtsp://10.0.0.7/live");
    assert_eq!(cfg.source.transcoder, "/usr/local/bin/ffmpeg");

    clear_env();
}

#[test]
fn rejects_invalid_configs() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        (r#"{ "cameras": [] }"#, "at least one camera"),
        (
            r#"{ "cameras": [ { "id": "lab 1", "url": "stub://a" } ] }"#,
            "camera id",
        ),
        (
            r#"{ "cameras": [ { "id": "a", "url": "stub://a" }, { "id": "A", "url": "stub://b" } ] }"#,
            "duplicate camera id",
        ),
        (
            r#"{ "cameras": [ { "id": "a", "url": "http://cam/mjpeg" } ] }"#,
            "camera 'a'",
        ),
        (r#"{ "source": { "target_fps": 0 } }"#, "target_fps"),
        (r#"{ "feed": { "queue_depth": 0 } }"#, "queue_depth"),
        (r#"{ "feed": { "addr": "localhost" } }"#, "feed addr"),
        (r#"{ "recognition": { "recognizer_url": "ftp://x" } }"#, "recognizer_url"),
        (r#"{ "unknown_section": {} }"#, "invalid config file"),
    ];

    for (json, expected) in cases {
        let mut file = NamedTempFile::new().expect("temp config");
        file.write_all(json.as_bytes()).expect("write config");
        let err = RelayConfig::load_from(Some(file.path())).expect_err(json);
        let message = format!("{:#}", err);
        assert!(
            message.contains(expected),
            "config {} failed with '{}', expected '{}'",
            json,
            message,
            expected
        );
    }

    std::env::set_var("CAMGATE_TARGET_FPS", "fast");
    let err = RelayConfig::load().expect_err("bad fps");
    assert!(err.to_string().contains("CAMGATE_TARGET_FPS"));

    clear_env();
}
