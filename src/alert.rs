use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::json;

/// Operator-visible failure channel. Delivery problems never reach the caller.
pub trait AlertSink: Send + Sync {
    fn notify(&self, message: &str);
}

impl<T: AlertSink + ?Sized> AlertSink for Arc<T> {
    fn notify(&self, message: &str) {
        (**self).notify(message)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, message: &str) {
        tracing::error!(alert = true, "{message}");
    }
}

/// Posts `{"text": message}` to a chat webhook from a background sender
/// thread; `notify` only queues the message.
#[derive(Clone)]
pub struct WebhookAlertSink {
    sender: mpsc::Sender<String>,
}

impl WebhookAlertSink {
    pub fn new(url: &str) -> Option<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .ok()?;
        let url = url.to_string();
        let (sender, receiver) = mpsc::channel::<String>();
        thread::Builder::new()
            .name("adc-cache-alerts".to_string())
            .spawn(move || {
                for message in receiver {
                    deliver(&client, &url, &message);
                }
            })
            .ok()?;
        Some(Self { sender })
    }
}

fn deliver(client: &Client, url: &str, message: &str) {
    let result = client.post(url).json(&json!({ "text": message })).send();
    match result {
        Ok(response) if !response.status().is_success() => {
            tracing::warn!(status = response.status().as_u16(), "alert webhook rejected message");
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "alert webhook unreachable"),
    }
}

impl AlertSink for WebhookAlertSink {
    fn notify(&self, message: &str) {
        tracing::error!(alert = true, "{message}");
        if self.sender.send(message.to_string()).is_err() {
            tracing::warn!("alert webhook sender stopped");
        }
    }
}

/// Webhook delivery when configured, log-only otherwise.
pub fn alert_sink_from_config(webhook: Option<&str>) -> Box<dyn AlertSink> {
    match webhook.and_then(WebhookAlertSink::new) {
        Some(sink) => Box::new(sink),
        None => Box::new(LogAlertSink),
    }
}

impl AlertSink for Box<dyn AlertSink> {
    fn notify(&self, message: &str) {
        (**self).notify(message)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Instant;

    use super::*;

    #[test]
    fn webhook_notify_returns_while_delivery_is_pending() {
        // accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/hooks/adc", listener.local_addr().unwrap());
        let sink = WebhookAlertSink::new(&url).unwrap();

        let started = Instant::now();
        for attempt in 0..3 {
            sink.notify(&format!("cache failure {attempt}"));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(listener);
    }

    #[test]
    fn webhook_delivers_message_text() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/hooks/adc", listener.local_addr().unwrap());
        let (received_tx, received_rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 1024];
            while !String::from_utf8_lossy(&request).contains("study S1 failed") {
                match stream.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(read) => request.extend_from_slice(&buffer[..read]),
                }
            }
            let _ = received_tx.send(String::from_utf8_lossy(&request).to_string());
        });

        WebhookAlertSink::new(&url).unwrap().notify("study S1 failed");

        let request = received_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(request.starts_with("POST /hooks/adc"));
        assert!(request.contains(r#"{"text":"study S1 failed"}"#));
    }
}
