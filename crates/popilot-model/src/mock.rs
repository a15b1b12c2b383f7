// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted chat transport for tests.
//!
//! Each call to [`ChatTransport::open`] pops the next scripted event list and
//! replays it as a stream.  Requests are recorded so tests can assert on the
//! payloads (thread id threading, retry counts).

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::{ChatError, ChatRequest, ChatTransport, ResponseStream, StreamEvent};

pub struct MockTransport {
    scripts: Mutex<VecDeque<Vec<Result<StreamEvent, ChatError>>>>,
    requests: Mutex<Vec<ChatRequest>>,
    /// When true and the script queue is empty, `open` returns a stream that
    /// never yields (for timeout/cancellation tests).
    pend_when_empty: bool,
}

impl MockTransport {
    /// One inner `Vec` per expected request, in order.
    pub fn with_script(scripts: Vec<Vec<Result<StreamEvent, ChatError>>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            pend_when_empty: false,
        }
    }

    /// A transport whose stream never produces an event.
    pub fn pending() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            pend_when_empty: true,
        }
    }

    /// Convenience: a single request answered with plain text.
    pub fn single_text(text: &str) -> Self {
        Self::with_script(vec![vec![
            Ok(StreamEvent::TextDelta(text.to_string())),
            Ok(StreamEvent::Done),
        ]])
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn open(&self, req: &ChatRequest) -> Result<ResponseStream, ChatError> {
        self.requests.lock().unwrap().push(req.clone());
        let next = self.scripts.lock().unwrap().pop_front();
        match next {
            Some(events) => Ok(Box::pin(futures::stream::iter(events))),
            None if self.pend_when_empty => Ok(Box::pin(futures::stream::pending())),
            None => Ok(Box::pin(futures::stream::iter(vec![Ok(StreamEvent::Done)]))),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn scripts_replay_in_order() {
        let mock = MockTransport::with_script(vec![
            vec![Ok(StreamEvent::TextDelta("first".into())), Ok(StreamEvent::Done)],
            vec![Ok(StreamEvent::TextDelta("second".into())), Ok(StreamEvent::Done)],
        ]);
        let req = ChatRequest { text: "x".into(), files: vec![], thread_id: None };

        let first: Vec<_> = mock.open(&req).await.unwrap().collect().await;
        assert!(matches!(&first[0], Ok(StreamEvent::TextDelta(t)) if t == "first"));

        let second: Vec<_> = mock.open(&req).await.unwrap().collect().await;
        assert!(matches!(&second[0], Ok(StreamEvent::TextDelta(t)) if t == "second"));

        assert_eq!(mock.requests().len(), 2);
    }
}
