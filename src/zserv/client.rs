use std::io::{self, Error, ErrorKind};
use std::net::IpAddr;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use super::{
    Body, Command, Message, NexthopRegisterBody, RouteBody, RouteType, ZservCodec, VRF_DEFAULT,
};

/// Byte streams the client can frame messages over
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Link for T {}

/// Framed session with the RIB daemon. Outbound sends go through the
/// write half; a reader task surfaces inbound messages on a channel,
/// which yields `None` once the session is lost.
pub struct ZservClient {
    version: u8,
    route_type: RouteType,
    sink: SplitSink<Framed<Box<dyn Link>, ZservCodec>, Message>,
    incoming: mpsc::UnboundedReceiver<Message>,
    reader: JoinHandle<()>,
}

impl ZservClient {
    /// Open a session against `scheme:addr`, negotiating the message
    /// version by sending a HELLO for each candidate in order.
    pub async fn connect(
        scheme: &str,
        addr: &str,
        route_type: RouteType,
        versions: &[u8],
    ) -> io::Result<ZservClient> {
        let mut last_err = Error::new(ErrorKind::InvalidInput, "No message version to try");
        for &version in versions {
            let link: Box<dyn Link> = match scheme {
                "tcp" => Box::new(TcpStream::connect(addr).await?),
                #[cfg(unix)]
                "unix" => Box::new(UnixStream::connect(addr).await?),
                _ => {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        format!("Unsupported scheme: '{}'", scheme),
                    ));
                }
            };
            let mut client = Self::from_link(link, version, route_type);
            match client.send_hello().await {
                Ok(()) => {
                    debug!("Session opened with message version {}", version);
                    return Ok(client);
                }
                Err(err) => {
                    // Retry with another message version
                    warn!(
                        "Cannot open session with message version {}: {}",
                        version, err
                    );
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Frame an already-connected stream. Used directly in tests and by
    /// `connect` once a transport is up.
    pub fn from_stream<T: Link + 'static>(
        stream: T,
        version: u8,
        route_type: RouteType,
    ) -> ZservClient {
        Self::from_link(Box::new(stream), version, route_type)
    }

    fn from_link(link: Box<dyn Link>, version: u8, route_type: RouteType) -> ZservClient {
        let framed = Framed::new(link, ZservCodec::new(version));
        let (sink, mut stream) = framed.split();
        let (tx, incoming) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(message) => {
                        trace!("Inbound {} message", message.header.command);
                        if tx.send(message).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!("Failed to decode message from RIB daemon: {}", err);
                        return;
                    }
                }
            }
        });
        ZservClient {
            version,
            route_type,
            sink,
            incoming,
            reader,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Next inbound message; `None` once the session is lost
    pub async fn recv(&mut self) -> Option<Message> {
        self.incoming.recv().await
    }

    pub async fn send_command(
        &mut self,
        command: Command,
        vrf_id: u16,
        body: Body,
    ) -> io::Result<()> {
        trace!("Outbound {} message", command);
        self.sink
            .send(Message::new(self.version, vrf_id, command, body))
            .await
    }

    async fn send_hello(&mut self) -> io::Result<()> {
        let route_type = self.route_type;
        self.send_command(Command::Hello, VRF_DEFAULT, Body::RouteType(route_type))
            .await
    }

    pub async fn send_interface_add(&mut self) -> io::Result<()> {
        self.send_command(Command::InterfaceAdd, VRF_DEFAULT, Body::Empty)
            .await
    }

    pub async fn send_redistribute(&mut self, route_type: RouteType) -> io::Result<()> {
        self.send_command(
            Command::RedistributeAdd,
            VRF_DEFAULT,
            Body::RouteType(route_type),
        )
        .await
    }

    /// Send a route message; the command is picked from the prefix
    /// family and whether this is an add or a withdraw.
    pub async fn send_route(
        &mut self,
        vrf_id: u16,
        body: RouteBody,
        is_withdraw: bool,
    ) -> io::Result<()> {
        let command = match (body.prefix, is_withdraw) {
            (IpAddr::V4(_), false) => Command::Ipv4RouteAdd,
            (IpAddr::V4(_), true) => Command::Ipv4RouteDelete,
            (IpAddr::V6(_), false) => Command::Ipv6RouteAdd,
            (IpAddr::V6(_), true) => Command::Ipv6RouteDelete,
        };
        self.send_command(command, vrf_id, Body::Route(body)).await
    }

    pub async fn send_nexthop_register(
        &mut self,
        vrf_id: u16,
        body: NexthopRegisterBody,
        is_withdraw: bool,
    ) -> io::Result<()> {
        if is_withdraw {
            return self.send_nexthop_unregister(vrf_id, body).await;
        }
        self.send_command(Command::NexthopRegister, vrf_id, Body::NexthopRegister(body))
            .await
    }

    /// Tell the daemon to stop tracking the listed nexthops
    pub async fn send_nexthop_unregister(
        &mut self,
        vrf_id: u16,
        body: NexthopRegisterBody,
    ) -> io::Result<()> {
        self.send_command(
            Command::NexthopUnregister,
            vrf_id,
            Body::NexthopRegister(body),
        )
        .await
    }

    pub async fn send_vrf_register(&mut self, vrf_id: u32) -> io::Result<()> {
        self.send_command(
            Command::VrfRegister,
            VRF_DEFAULT,
            Body::Unknown(vrf_id.to_be_bytes().to_vec()),
        )
        .await
    }

    pub async fn send_vrf_unregister(&mut self, vrf_id: u32) -> io::Result<()> {
        self.send_command(
            Command::VrfUnregister,
            VRF_DEFAULT,
            Body::Unknown(vrf_id.to_be_bytes().to_vec()),
        )
        .await
    }
}

impl Drop for ZservClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
