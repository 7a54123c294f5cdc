//! Broker frontend client

use bytes::Bytes;
use sliceio_common::{Error, Result};
use sliceio_proto::{Message, MsgType, action, read_message, status, write_message};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::trace;

/// How long a request waits for its reply unless overridden
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Decoded worker reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Data { key: Bytes, payload: Bytes },
    NotFound,
    Pending,
    Error,
}

impl Reply {
    /// Decode a reply as relayed by the broker (identity envelope removed)
    pub fn from_message(msg: &Message) -> Result<Self> {
        match msg.msgtype() {
            MsgType::Data => {
                let (Some(key), Some(payload)) = (msg.get(1), msg.get(2)) else {
                    return Err(Error::protocol(format!("truncated data reply: {msg:?}")));
                };
                Ok(Self::Data {
                    key: key.clone(),
                    payload: payload.clone(),
                })
            }
            MsgType::Status => {
                if msg.is_status(status::WORKER_ACK) {
                    Ok(Self::Ack)
                } else if msg.is_status(status::WORKER_NOTFOUND) {
                    Ok(Self::NotFound)
                } else if msg.is_status(status::WORKER_PENDING) {
                    Ok(Self::Pending)
                } else if msg.is_status(status::WORKER_ERROR) {
                    Ok(Self::Error)
                } else {
                    Err(Error::protocol(format!("unexpected status reply: {msg:?}")))
                }
            }
            _ => Err(Error::protocol(format!("unexpected reply: {msg:?}"))),
        }
    }

    /// Payload of a `Data` reply
    #[must_use]
    pub fn into_payload(self) -> Option<Bytes> {
        match self {
            Self::Data { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// Connection to a broker frontend.
///
/// Requests are sent one at a time; each waits for its reply.
pub struct Client {
    stream: TcpStream,
    timeout: Duration,
}

impl Client {
    /// Connect to the broker frontend at `addr`
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Override the per-request reply timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn put(&mut self, key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Result<Reply> {
        self.request(Message::action(action::PUT, key, Some(payload.into())))
            .await
    }

    pub async fn get(&mut self, key: impl Into<Bytes>) -> Result<Reply> {
        self.request(Message::action(action::GET, key, None)).await
    }

    pub async fn delete(&mut self, key: impl Into<Bytes>) -> Result<Reply> {
        self.request(Message::action(action::DEL, key, None)).await
    }

    /// Send one request and wait for its reply
    pub async fn request(&mut self, msg: Message) -> Result<Reply> {
        trace!(request = ?msg, "Sending request");
        write_message(&mut self.stream, &msg).await?;

        let reply = tokio::time::timeout(self.timeout, read_message(&mut self.stream))
            .await
            .map_err(|_| Error::Timeout)??
            .ok_or(Error::ConnectionClosed)?;
        trace!(reply = ?reply, "Received reply");
        Reply::from_message(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_decode_replies() {
        assert_eq!(
            Reply::from_message(&Message::status(status::WORKER_ACK)).unwrap(),
            Reply::Ack
        );
        assert_eq!(
            Reply::from_message(&Message::status(status::WORKER_NOTFOUND)).unwrap(),
            Reply::NotFound
        );
        assert_eq!(
            Reply::from_message(&Message::key_data("k", "v")).unwrap(),
            Reply::Data {
                key: Bytes::from_static(b"k"),
                payload: Bytes::from_static(b"v"),
            }
        );
        assert!(Reply::from_message(&Message::status(status::BROKER_ACK)).is_err());
        assert!(Reply::from_message(&Message::new()).is_err());
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_message(&mut stream).await.unwrap().unwrap();
            assert!(request.is_action(action::GET));
            assert_eq!(request.get(2).unwrap().as_ref(), b"alpha");
            write_message(&mut stream, &Message::key_data("alpha", "value"))
                .await
                .unwrap();
        });

        let mut client = Client::connect(addr).await.unwrap();
        let reply = client.get("alpha").await.unwrap();
        assert_eq!(reply.into_payload().unwrap().as_ref(), b"value");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let mut client = Client::connect(addr)
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let err = client.put("k", "v").await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
