use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::BoxFuture;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Longest response line accepted from the engine
pub const MAX_RESPONSE_BYTES: u64 = 4096;

/// Line-oriented control interface of the mixing engine
///
/// `send_command` sends one command line and returns the first response line,
/// trimmed. An empty response is an error. The remaining methods are the
/// commands the coordinator uses.
pub trait EngineClient: Send + Sync {
    fn send_command<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String, EngineError>>;

    fn set_plan<'a>(&'a self, plan: &'a str) -> BoxFuture<'a, Result<String, EngineError>> {
        Box::pin(async move { self.send_command(&format!("set_plan {}", plan)).await })
    }

    fn get_plan(&self) -> BoxFuture<'_, Result<String, EngineError>> {
        self.send_command("get_plan")
    }

    /// `true` when the engine reports `enabled`
    fn processing_enabled(&self) -> BoxFuture<'_, Result<bool, EngineError>> {
        Box::pin(async move {
            let response = self.send_command("get_processing_status").await?;
            Ok(response == "enabled")
        })
    }

    fn set_processing(&self, enable: bool) -> BoxFuture<'_, Result<String, EngineError>> {
        if enable {
            self.send_command("enable_processing")
        } else {
            self.send_command("disable_processing")
        }
    }

    fn reset_audio(&self) -> BoxFuture<'_, Result<String, EngineError>> {
        self.send_command("reset_audio")
    }

    fn set_parameter<'a>(
        &'a self,
        parameter: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, Result<String, EngineError>> {
        Box::pin(async move {
            self.send_command(&format!("set_{} {}", parameter, value))
                .await
        })
    }
}

/// TCP client opening a fresh connection per command
pub struct TcpEngineClient {
    address: String,
    timeout: Duration,
}

impl TcpEngineClient {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.address(), config.timeout())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn exchange(&self, command: &str) -> Result<String, EngineError> {
        let mut stream =
            TcpStream::connect(&self.address)
                .await
                .map_err(|source| EngineError::Connect {
                    address: self.address.clone(),
                    source,
                })?;
        stream.write_all(format!("{}\n", command).as_bytes()).await?;

        let mut reader = BufReader::new(stream.take(MAX_RESPONSE_BYTES));
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read as u64 >= MAX_RESPONSE_BYTES && !line.ends_with('\n') {
            return Err(EngineError::ResponseTooLong {
                command: command.to_string(),
                limit: MAX_RESPONSE_BYTES,
            });
        }
        Ok(line)
    }
}

impl EngineClient for TcpEngineClient {
    fn send_command<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String, EngineError>> {
        Box::pin(async move {
            let line = tokio::time::timeout(self.timeout, self.exchange(command))
                .await
                .map_err(|_| EngineError::Timeout(command.to_string()))??;

            let response = line.trim();
            if response.is_empty() {
                return Err(EngineError::EmptyResponse(command.to_string()));
            }
            debug!("Engine response to '{}': {}", command, response);
            Ok(response.to_string())
        })
    }
}

/// Scripted engine for tests and offline runs
///
/// Every command is recorded. Queued responses are returned first, then the
/// fixed response for the command, then `OK`.
#[derive(Default)]
pub struct MockEngine {
    commands: Mutex<Vec<String>>,
    fixed: Mutex<HashMap<String, String>>,
    queued: Mutex<HashMap<String, VecDeque<Option<String>>>>,
    unreachable: Mutex<bool>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with `response` from now on
    pub fn respond(&self, command: &str, response: &str) {
        self.fixed
            .lock()
            .insert(command.to_string(), response.to_string());
    }

    /// Answer the next `command` with an empty line
    pub fn respond_empty_once(&self, command: &str) {
        self.queued
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(None);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock() = unreachable;
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
    }
}

impl EngineClient for MockEngine {
    fn send_command<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String, EngineError>> {
        Box::pin(async move {
            self.commands.lock().push(command.to_string());
            if *self.unreachable.lock() {
                return Err(EngineError::Connect {
                    address: "mock".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    ),
                });
            }

            let queued = self
                .queued
                .lock()
                .get_mut(command)
                .and_then(VecDeque::pop_front);
            match queued {
                Some(Some(response)) => Ok(response),
                Some(None) => Err(EngineError::EmptyResponse(command.to_string())),
                None => Ok(self
                    .fixed
                    .lock()
                    .get(command)
                    .cloned()
                    .unwrap_or_else(|| "OK".to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serve `connections` commands, answering each with `reply(command)`
    async fn fake_engine<F>(connections: usize, reply: F) -> (String, tokio::task::JoinHandle<Vec<String>>)
    where
        F: Fn(&str) -> String + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let mut received = Vec::new();
            for _ in 0..connections {
                let (socket, _) = listener.accept().await.unwrap();
                let (read, mut write) = socket.into_split();
                let mut reader = BufReader::new(read);
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let command = line.trim().to_string();
                write.write_all(reply(&command).as_bytes()).await.unwrap();
                received.push(command);
            }
            received
        });
        (address, handle)
    }

    #[tokio::test]
    async fn test_set_and_get_plan() {
        let (address, server) = fake_engine(2, |command| match command {
            "get_plan" => "B2\nEND\n".to_string(),
            _ => "Plan set\n".to_string(),
        })
        .await;
        let client = TcpEngineClient::new(address, Duration::from_secs(2));

        assert_eq!(client.set_plan("C").await.unwrap(), "Plan set");
        assert_eq!(client.get_plan().await.unwrap(), "B2");
        assert_eq!(server.await.unwrap(), vec!["set_plan C", "get_plan"]);
    }

    #[tokio::test]
    async fn test_empty_response_is_an_error() {
        let (address, _server) = fake_engine(1, |_| "\n".to_string()).await;
        let client = TcpEngineClient::new(address, Duration::from_secs(2));

        assert!(matches!(
            client.get_plan().await,
            Err(EngineError::EmptyResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_response_is_rejected() {
        let (address, _server) = fake_engine(1, |_| format!("{}\n", "x".repeat(10_000))).await;
        let client = TcpEngineClient::new(address, Duration::from_secs(2));

        assert!(matches!(
            client.get_plan().await,
            Err(EngineError::ResponseTooLong { limit: MAX_RESPONSE_BYTES, .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_engine() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = TcpEngineClient::new(address, Duration::from_secs(2));
        assert!(matches!(
            client.get_plan().await,
            Err(EngineError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_engine_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let client = TcpEngineClient::new(address, Duration::from_millis(100));
        assert!(matches!(
            client.get_plan().await,
            Err(EngineError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_processing_status_and_parameters() {
        let engine = MockEngine::new();
        engine.respond("get_processing_status", "enabled");

        assert!(engine.processing_enabled().await.unwrap());
        engine.respond("get_processing_status", "disabled");
        assert!(!engine.processing_enabled().await.unwrap());

        engine.set_processing(false).await.unwrap();
        engine.set_parameter("compress_ratio", "4.5").await.unwrap();
        assert_eq!(
            engine.commands()[2..],
            [
                "disable_processing".to_string(),
                "set_compress_ratio 4.5".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_mock_engine_queued_empty_response() {
        let engine = MockEngine::new();
        engine.respond("get_plan", "A2");
        engine.respond_empty_once("get_plan");

        assert!(engine.get_plan().await.is_err());
        assert_eq!(engine.get_plan().await.unwrap(), "A2");
    }
}
