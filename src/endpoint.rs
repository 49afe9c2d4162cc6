use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;
use crate::frame::{Nak, RttmHeader, StatusMessage};

/// The channel endpoint an image's control frames go out through: status messages, NAKs and
///  RTT measurement requests to the sender's control address.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceiveChannelEndpoint: Send + Sync + 'static {
    async fn send_status_message(&self, to: SocketAddr, status_message: &StatusMessage) -> anyhow::Result<()>;
    async fn send_nak(&self, to: SocketAddr, nak: &Nak) -> anyhow::Result<()>;
    async fn send_rttm(&self, to: SocketAddr, rttm: &RttmHeader) -> anyhow::Result<()>;
}

pub struct UdpReceiveChannelEndpoint {
    socket: Arc<UdpSocket>,
}

impl Debug for UdpReceiveChannelEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpReceiveChannelEndpoint{{{:?}}}", self.socket.local_addr().ok())
    }
}

impl UdpReceiveChannelEndpoint {
    pub fn new(socket: Arc<UdpSocket>) -> UdpReceiveChannelEndpoint {
        UdpReceiveChannelEndpoint {
            socket,
        }
    }

    async fn send_frame(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        trace!(?to, len = buf.len(), "sending control frame");
        self.socket.send_to(buf, to).await?;
        Ok(())
    }
}

#[async_trait]
impl ReceiveChannelEndpoint for UdpReceiveChannelEndpoint {
    async fn send_status_message(&self, to: SocketAddr, status_message: &StatusMessage) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        status_message.ser(&mut buf);
        self.send_frame(to, &buf).await
    }

    async fn send_nak(&self, to: SocketAddr, nak: &Nak) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        nak.ser(&mut buf);
        self.send_frame(to, &buf).await
    }

    async fn send_rttm(&self, to: SocketAddr, rttm: &RttmHeader) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        rttm.ser(&mut buf);
        self.send_frame(to, &buf).await
    }
}
