//! [`DatagramConn`] over a quinn connection. Enabled with the `quinn`
//! feature; everything else in the crate works against the trait alone.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::conn::DatagramConn;

pub struct QuinnConn {
    conn: quinn::Connection,
    token: CancellationToken,
}

impl QuinnConn {
    pub fn new(conn: quinn::Connection) -> Self {
        let token = CancellationToken::new();
        let signal = token.clone();
        let watched = conn.clone();
        tokio::spawn(async move {
            watched.closed().await;
            signal.cancel();
        });
        Self { conn, token }
    }

    pub fn connection(&self) -> &quinn::Connection {
        &self.conn
    }
}

#[async_trait]
impl DatagramConn for QuinnConn {
    fn context(&self) -> CancellationToken {
        self.token.clone()
    }

    fn send_datagram(&self, data: &[u8]) -> io::Result<()> {
        self.conn
            .send_datagram(Bytes::copy_from_slice(data))
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }

    async fn receive_datagram(&self) -> io::Result<Bytes> {
        self.conn
            .read_datagram()
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}
