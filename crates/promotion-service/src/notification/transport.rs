//! 客户端传输抽象
//!
//! 中继只需要"写一帧文本"和"关闭"两个能力，具体协议（WebSocket 等）由外层实现

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{EntitlementError, Result};

/// 单个客户端会话的帧写入端
#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, frame: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// 基于 tokio mpsc 的帧写入端
///
/// 接收端即客户端连接的写任务；close 后接收端读到 `None`
pub struct ChannelSink {
    tx: Option<mpsc::Sender<String>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx: Some(tx) }
    }

    /// 创建一对写入端与接收端
    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn write_frame(&mut self, frame: &str) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| EntitlementError::Transport("连接已关闭".to_string()))?;
        tx.send(frame.to_owned())
            .await
            .map_err(|_| EntitlementError::Transport("客户端已断开".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_close() {
        let (mut sink, mut rx) = ChannelSink::pair(4);
        sink.write_frame("hello").await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert!(rx.recv().await.is_none());
        assert!(sink.is_closed());
        assert!(matches!(
            sink.write_frame("late").await,
            Err(EntitlementError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_write_after_receiver_dropped() {
        let (mut sink, rx) = ChannelSink::pair(1);
        drop(rx);
        assert!(sink.write_frame("x").await.is_err());
    }
}
