//! Resumable Stream Client
//!
//! Reads a session's NDJSON stream from a relay daemon and survives
//! connection loss.
//!
//! # Reconnection
//!
//! The reader remembers the LSN of the last frame it returned. When the
//! connection drops it asks the daemon for the session's status:
//!
//! - finished cleanly with nothing new: the stream ends
//! - failed with nothing new: the stored error is returned
//! - otherwise: reconnect with `from=<last lsn>` after an exponential backoff
//!
//! Configure via [`ClientConfig`]:
//! - `reconnect_attempts`: consecutive failures tolerated (0 = no reconnection)
//! - `reconnect_delay`: initial delay between attempts (doubles each retry)

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;

use crate::buffer::Lsn;
use crate::error::{RelayError, Result};
use crate::session::{SessionId, SessionInfo, SessionStatus};
use crate::streaming::StreamFrame;
use crate::transport::NdjsonDecoder;

/// Reconnection policy for [`ResumableReader`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Consecutive failed connections tolerated before giving up
    pub reconnect_attempts: u32,
    /// Delay before the first reconnection attempt
    pub reconnect_delay: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

type BodyStream = BoxStream<'static, reqwest::Result<Bytes>>;

/// Reader for one session's stream that reconnects where it left off
pub struct ResumableReader<T> {
    http: reqwest::Client,
    base_url: String,
    session_id: SessionId,
    config: ClientConfig,
    last_lsn: Lsn,
    body: Option<BodyStream>,
    decoder: NdjsonDecoder,
    failures: u32,
    finished: bool,
    _frames: PhantomData<fn() -> T>,
}

impl<T> ResumableReader<T>
where
    T: DeserializeOwned,
{
    /// Create a reader for `session_id` on the daemon at `base_url`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        session_id: SessionId,
        config: ClientConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id,
            config,
            last_lsn: 0,
            body: None,
            decoder: NdjsonDecoder::new(),
            failures: 0,
            finished: false,
            _frames: PhantomData,
        })
    }

    /// Start after `lsn` instead of the beginning of the log
    #[must_use]
    pub fn resume_from(mut self, lsn: Lsn) -> Self {
        self.last_lsn = lsn;
        self
    }

    /// LSN of the last frame returned
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Session being read
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn session_url(&self) -> String {
        format!("{}/api/v1/sessions/{}", self.base_url, self.session_id)
    }

    /// Fetch the session's current status from the daemon
    ///
    /// # Errors
    ///
    /// - [`RelayError::SessionNotFound`] if the daemon does not know the session
    /// - [`RelayError::Transport`] on connection or decoding failures
    pub async fn session_info(&self) -> Result<SessionInfo> {
        self.fetch_info().await
    }

    /// Status request that owns everything it needs
    ///
    /// The returned future holds no borrow of the reader, which keeps
    /// [`ResumableReader::next`] `Send` across its await points.
    fn fetch_info(&self) -> impl Future<Output = Result<SessionInfo>> + Send + 'static {
        let request = self.http.get(self.session_url());
        let session_id = self.session_id.clone();
        async move {
            let response = request.send().await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(RelayError::SessionNotFound(session_id));
            }
            let response = response.error_for_status()?;
            Ok(response.json().await?)
        }
    }

    fn open(&self) -> impl Future<Output = Result<BodyStream>> + Send + 'static {
        let request = self
            .http
            .get(format!("{}/stream", self.session_url()))
            .query(&[("from", self.last_lsn)]);
        let session_id = self.session_id.clone();
        let from = self.last_lsn;
        async move {
            let response = request.send().await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(RelayError::SessionNotFound(session_id));
            }
            let response = response.error_for_status()?;

            tracing::debug!(session_id = %session_id, from, "Stream opened");
            Ok(response.bytes_stream().boxed())
        }
    }

    /// Next frame, reconnecting as needed
    ///
    /// Returns `None` once the session completed and every frame was read.
    /// After an `Err` the reader is finished.
    pub async fn next(&mut self) -> Option<Result<StreamFrame<T>>> {
        loop {
            if self.finished {
                return None;
            }

            match self.decoder.decode::<StreamFrame<T>>() {
                Ok(Some(frame)) => return Some(self.accept(frame)),
                Ok(None) => {}
                Err(e) => return Some(self.finish_with(e)),
            }

            if self.body.is_none() {
                match self.open().await {
                    Ok(body) => self.body = Some(body),
                    Err(e) if e.is_not_found() => return Some(self.finish_with(e)),
                    Err(e) => {
                        if let Recovery::Stop(outcome) = self.recover(e).await {
                            return outcome;
                        }
                        continue;
                    }
                }
            }
            let Some(body) = self.body.as_mut() else {
                continue;
            };

            let interruption = match body.next().await {
                Some(Ok(chunk)) => {
                    self.decoder.push(&chunk);
                    continue;
                }
                Some(Err(e)) => RelayError::from(e),
                None if self.decoder.available() == 0 => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        lsn = self.last_lsn,
                        "Stream finished"
                    );
                    self.finished = true;
                    return None;
                }
                None => RelayError::Transport("stream ended mid-frame".to_string()),
            };

            if let Recovery::Stop(outcome) = self.recover(interruption).await {
                return outcome;
            }
        }
    }

    /// Drive the reader as a `Stream`
    pub fn into_stream(self) -> BoxStream<'static, Result<StreamFrame<T>>>
    where
        T: Send + 'static,
    {
        stream::unfold(self, |mut reader| async move {
            let item = reader.next().await?;
            Some((item, reader))
        })
        .boxed()
    }

    fn accept(&mut self, frame: StreamFrame<T>) -> Result<StreamFrame<T>> {
        let expected = self.last_lsn + 1;
        if frame.lsn != expected {
            self.finished = true;
            return Err(RelayError::Transport(format!(
                "expected lsn {expected}, received {}",
                frame.lsn
            )));
        }
        self.last_lsn = frame.lsn;
        self.failures = 0;
        Ok(frame)
    }

    fn finish_with(&mut self, error: RelayError) -> Result<StreamFrame<T>> {
        self.finished = true;
        self.body = None;
        Err(error)
    }

    fn stop_with(&mut self, error: RelayError) -> Recovery<T> {
        Recovery::Stop(Some(self.finish_with(error)))
    }

    /// Decide what a dropped connection means
    ///
    /// Waits out the backoff before returning [`Recovery::Retry`].
    async fn recover(&mut self, interruption: RelayError) -> Recovery<T> {
        self.body = None;
        self.decoder.clear();

        tracing::debug!(
            session_id = %self.session_id,
            lsn = self.last_lsn,
            error = %interruption,
            "Stream interrupted"
        );

        match self.fetch_info().await {
            Ok(info) if info.lsn <= self.last_lsn => match info.status {
                SessionStatus::Complete => {
                    self.finished = true;
                    return Recovery::Stop(None);
                }
                SessionStatus::Aborted => {
                    return self.stop_with(RelayError::Aborted);
                }
                SessionStatus::Error | SessionStatus::Timeout => {
                    let message = info.error.unwrap_or_else(|| info.status.to_string());
                    return self.stop_with(RelayError::Producer(message));
                }
                SessionStatus::Streaming | SessionStatus::Orphaned => {}
            },
            Ok(_) => {}
            Err(e) if e.is_not_found() => return self.stop_with(e),
            Err(_) => {}
        }

        if self.failures >= self.config.reconnect_attempts {
            tracing::warn!(
                session_id = %self.session_id,
                attempts = self.failures,
                "Max reconnection attempts reached"
            );
            return self.stop_with(interruption);
        }

        // Exponential backoff, capped at 64x the base delay
        let delay = self.config.reconnect_delay * (1u32 << self.failures.min(6));
        self.failures += 1;
        tracing::info!(
            session_id = %self.session_id,
            attempt = self.failures,
            max_attempts = self.config.reconnect_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting"
        );
        tokio::time::sleep(delay).await;
        Recovery::Retry
    }
}

enum Recovery<T> {
    Stop(Option<Result<StreamFrame<T>>>),
    Retry,
}

impl<T> std::fmt::Debug for ResumableReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableReader")
            .field("base_url", &self.base_url)
            .field("session_id", &self.session_id)
            .field("last_lsn", &self.last_lsn)
            .field("failures", &self.failures)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> ResumableReader<String> {
        ResumableReader::new(
            "http://127.0.0.1:7878/",
            SessionId::from("s1"),
            ClientConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_session_url() {
        let reader = reader();
        assert_eq!(
            reader.session_url(),
            "http://127.0.0.1:7878/api/v1/sessions/s1"
        );
    }

    #[test]
    fn test_resume_from() {
        let reader = reader().resume_from(41);
        assert_eq!(reader.last_lsn(), 41);
    }

    #[test]
    fn test_accept_enforces_continuity() {
        let mut reader = reader().resume_from(2);
        let frame = reader
            .accept(StreamFrame {
                token: "c".to_string(),
                lsn: 3,
            })
            .unwrap();
        assert_eq!(frame.lsn, 3);
        assert_eq!(reader.last_lsn(), 3);

        let gap = reader.accept(StreamFrame {
            token: "e".to_string(),
            lsn: 5,
        });
        assert!(matches!(gap, Err(RelayError::Transport(_))));
        assert_eq!(reader.last_lsn(), 3);
    }

    #[tokio::test]
    async fn test_reader_runs_on_spawned_task() {
        // Nothing listens on a freshly released port
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = ClientConfig {
            reconnect_attempts: 0,
            ..ClientConfig::default()
        };
        let mut reader: ResumableReader<String> = ResumableReader::new(
            &format!("http://127.0.0.1:{port}/"),
            SessionId::from("s1"),
            config,
        )
        .unwrap();

        let first = tokio::spawn(async move { reader.next().await }).await.unwrap();
        assert!(matches!(first, Some(Err(_))));

        let stream = ResumableReader::<String>::new(
            &format!("http://127.0.0.1:{port}/"),
            SessionId::from("s1"),
            ClientConfig {
                reconnect_attempts: 0,
                ..ClientConfig::default()
            },
        )
        .unwrap()
        .into_stream();
        let frames: Vec<_> = tokio::spawn(stream.collect::<Vec<_>>()).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_err());
    }

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
    }
}
