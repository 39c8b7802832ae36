//! Live block fan-out.
//!
//! Downstream consumers subscribe for blocks as they are archived. Fan-out
//! must never exert backpressure on archiving, so subscribers ride a
//! broadcast channel: a reader that lags past the buffer is skipped ahead
//! (observing `RecvError::Lagged`) rather than stalling the pipeline.

use snafu::Snafu;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::block::Block;

#[derive(Debug, Snafu)]
pub enum StreamError {
    #[snafu(display("block stream server is closed"))]
    Closed,
}

#[derive(Debug)]
pub struct BlockStreamServer {
    sender: broadcast::Sender<Block>,
    closed: std::sync::atomic::AtomicBool,
}

impl BlockStreamServer {
    /// `buffer` bounds how far a subscriber may lag before it is skipped
    /// ahead.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        BlockStreamServer {
            sender,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Block> {
        self.sender.subscribe()
    }

    /// Subscription as a `Stream`; lag gaps surface as
    /// [`tokio_stream::wrappers::errors::BroadcastStreamRecvError`] items.
    pub fn subscribe_stream(&self) -> BroadcastStream<Block> {
        BroadcastStream::new(self.subscribe())
    }

    /// Publishes one block to current subscribers. A block published with no
    /// subscribers is simply dropped.
    pub fn push_block(&self, block: Block) -> Result<(), StreamError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        match self.sender.send(block) {
            Ok(receivers) => {
                trace!(message = "Pushed block to subscribers.", receivers);
            }
            Err(_) => {
                trace!(message = "No block stream subscribers.");
            }
        }
        Ok(())
    }

    /// Stops accepting blocks; subscribers see the channel close once the
    /// server is dropped.
    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Utc;

    use super::*;

    fn block(num: u64) -> Block {
        Block {
            num,
            id: format!("{num:02x}"),
            previous_id: format!("{:02x}", num.saturating_sub(1)),
            timestamp: Utc::now(),
            lib_num: 0,
            payload: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_pushed_blocks_in_order() {
        let server = BlockStreamServer::new(16);
        let mut subscriber = server.subscribe();

        server.push_block(block(1)).unwrap();
        server.push_block(block(2)).unwrap();

        assert_eq!(subscriber.recv().await.unwrap().num, 1);
        assert_eq!(subscriber.recv().await.unwrap().num, 2);
    }

    #[tokio::test]
    async fn pushing_without_subscribers_is_fine() {
        let server = BlockStreamServer::new(16);
        server.push_block(block(1)).unwrap();
    }

    #[tokio::test]
    async fn lagging_subscriber_is_skipped_ahead_not_blocking() {
        let server = BlockStreamServer::new(2);
        let mut subscriber = server.subscribe();

        for num in 1..=5 {
            server.push_block(block(num)).unwrap();
        }

        match subscriber.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_subscription_yields_blocks() {
        use futures::StreamExt;

        let server = BlockStreamServer::new(16);
        let mut stream = server.subscribe_stream();

        server.push_block(block(1)).unwrap();
        drop(server);

        assert_eq!(stream.next().await.unwrap().unwrap().num, 1);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn closed_server_rejects_pushes() {
        let server = BlockStreamServer::new(16);
        server.close();
        assert!(matches!(server.push_block(block(1)), Err(StreamError::Closed)));
    }
}
