use crate::domain::report::chunk_message;
use crate::error::SinkError;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MessageId(pub u64);

/// Where user-visible status text goes. Messages are posted once and may
/// then be edited in place.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn post(&self, session: &str, text: &str) -> Result<MessageId, SinkError>;

    async fn edit(&self, session: &str, id: MessageId, text: &str) -> Result<(), SinkError>;

    /// Longest message the sink accepts, in characters.
    fn max_message_len(&self) -> usize;
}

/// Post `text`, split into as many messages as the sink's length limit requires.
pub async fn post_chunked<N>(sink: &N, session: &str, text: &str) -> Result<Vec<MessageId>, SinkError>
where
    N: NotificationSink + ?Sized,
{
    let mut ids = Vec::new();
    for chunk in chunk_message(text, sink.max_message_len()) {
        ids.push(sink.post(session, &chunk).await?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    #[tokio::test]
    async fn test_post_chunked_splits_long_text() {
        let mut sink = MockNotificationSink::new();
        let mut seq = Sequence::new();
        sink.expect_max_message_len().return_const(4usize);
        sink.expect_post()
            .withf(|session, text| session == "s1" && text == "abcd")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(MessageId(1)));
        sink.expect_post()
            .withf(|session, text| session == "s1" && text == "ef")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(MessageId(2)));

        let ids = post_chunked(&sink, "s1", "abcdef").await.unwrap();
        assert_eq!(ids, vec![MessageId(1), MessageId(2)]);
    }

    #[tokio::test]
    async fn test_post_chunked_stops_on_rejection() {
        let mut sink = MockNotificationSink::new();
        sink.expect_max_message_len().return_const(2usize);
        sink.expect_post()
            .times(1)
            .returning(|_, _| Err(SinkError::Rejected("flood".into())));

        let err = post_chunked(&sink, "s1", "abcdef").await.unwrap_err();
        assert_eq!(err, SinkError::Rejected("flood".into()));
    }
}
