//! Remote text alerts over the LINE Messaging API.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub const LINE_PUSH_ENDPOINT: &str = "https://api.line.me/v2/bot/message/push";

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push rejected with status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Best-effort delivery of one free-text alert.
pub trait Notifier {
    fn notify(&self, text: &str) -> Result<(), NotifyError>;
}

/// Channel token and recipient for LINE push messages.
#[derive(Debug, Clone)]
pub struct LineCredentials {
    pub access_token: String,
    pub user_id: String,
}

impl LineCredentials {
    /// Both halves are required; anything less disables notification.
    pub fn from_parts(access_token: Option<String>, user_id: Option<String>) -> Option<Self> {
        Some(Self {
            access_token: access_token?,
            user_id: user_id?,
        })
    }
}

#[derive(Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    messages: [TextMessage<'a>; 1],
}

#[derive(Serialize)]
struct TextMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

pub struct LineNotifier {
    client: reqwest::blocking::Client,
    endpoint: String,
    credentials: Option<LineCredentials>,
}

impl LineNotifier {
    /// Build a notifier whose every request is bounded by `timeout`.
    pub fn new(credentials: Option<LineCredentials>, timeout: Duration) -> Result<Self, NotifyError> {
        if credentials.is_none() {
            tracing::info!("LINE credentials not set; failure alerts disabled");
        }
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: LINE_PUSH_ENDPOINT.to_string(),
            credentials,
        })
    }

    /// Send pushes somewhere other than the public LINE endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.credentials.is_some()
    }
}

impl Notifier for LineNotifier {
    fn notify(&self, text: &str) -> Result<(), NotifyError> {
        let Some(credentials) = &self.credentials else {
            tracing::debug!("notification skipped (no credentials)");
            return Ok(());
        };

        let body = PushRequest {
            to: &credentials.user_id,
            messages: [TextMessage { kind: "text", text }],
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&credentials.access_token)
            .json(&body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        tracing::info!("failure alert delivered");
        Ok(())
    }
}

/// Alert text for a finalized failure at `at`.
pub fn failure_message(at: DateTime<Local>) -> String {
    format!("Door access failed!\nTime: {}", at.format("%Y-%m-%d %H:%M:%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    /// Accept one request, answer with `status`, and hand back the raw request text.
    fn one_shot_server(status: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/v2/bot/message/push", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut raw = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).unwrap();
                raw.extend_from_slice(&chunk[..n]);
                if n == 0 || request_complete(&raw) {
                    break;
                }
            }
            let reply = format!("HTTP/1.1 {status}\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}");
            stream.write_all(reply.as_bytes()).unwrap();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (url, handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        raw.len() >= header_end + 4 + length
    }

    fn credentials() -> Option<LineCredentials> {
        LineCredentials::from_parts(Some("secret-token".into()), Some("U123".into()))
    }

    #[test]
    fn test_push_request_shape() {
        let (url, server) = one_shot_server("200 OK");
        let notifier = LineNotifier::new(credentials(), Duration::from_secs(5))
            .unwrap()
            .with_endpoint(url);

        notifier.notify("Door access failed!").unwrap();

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /v2/bot/message/push"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret-token"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["to"], "U123");
        assert_eq!(json["messages"][0]["type"], "text");
        assert_eq!(json["messages"][0]["text"], "Door access failed!");
    }

    #[test]
    fn test_non_success_status_is_error() {
        let (url, server) = one_shot_server("500 Internal Server Error");
        let notifier = LineNotifier::new(credentials(), Duration::from_secs(5))
            .unwrap()
            .with_endpoint(url);

        let err = notifier.notify("hello").unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, NotifyError::Status { status: 500, .. }));
    }

    #[test]
    fn test_unreachable_endpoint_is_error() {
        // Bind then drop to get a port with nothing listening.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let notifier = LineNotifier::new(credentials(), Duration::from_secs(2))
            .unwrap()
            .with_endpoint(format!("http://127.0.0.1:{port}/push"));
        assert!(matches!(notifier.notify("hello"), Err(NotifyError::Http(_))));
    }

    #[test]
    fn test_silent_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/push", listener.local_addr().unwrap());
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let server = std::thread::spawn(move || {
            // Hold the connection open without ever answering.
            let (_stream, _) = listener.accept().unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(30));
        });

        let notifier = LineNotifier::new(credentials(), Duration::from_secs(1))
            .unwrap()
            .with_endpoint(url);
        let started = std::time::Instant::now();
        let result = notifier.notify("hello");
        let elapsed = started.elapsed();

        release_tx.send(()).unwrap();
        server.join().unwrap();
        assert!(matches!(result, Err(NotifyError::Http(_))));
        assert!(elapsed < Duration::from_secs(3), "stalled for {elapsed:?}");
    }

    #[test]
    fn test_missing_credentials_is_noop() {
        let notifier = LineNotifier::new(None, Duration::from_secs(1))
            .unwrap()
            .with_endpoint("http://127.0.0.1:1/never");
        assert!(!notifier.is_enabled());
        assert!(notifier.notify("hello").is_ok());
    }

    #[test]
    fn test_credentials_need_both_parts() {
        assert!(LineCredentials::from_parts(Some("t".into()), None).is_none());
        assert!(LineCredentials::from_parts(None, Some("u".into())).is_none());
        assert!(credentials().is_some());
    }

    #[test]
    fn test_failure_message() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(failure_message(at), "Door access failed!\nTime: 2024-03-09 14:05:07");
    }
}
