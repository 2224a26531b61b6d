use std::io::{Error, ErrorKind};

use bgp_rs::AFI;
use bytes::{BufMut, BytesMut};
use log::trace;
use tokio_util::codec::{Decoder, Encoder};

use super::{
    Body, Command, Header, Message, NexthopRegisterBody, NexthopUpdateBody, RouteBody,
    HEADER_MARKER, HEADER_SIZE,
};

/// Frames RIB daemon messages: a fixed header carrying the total
/// length, followed by a command-tagged body.
#[derive(Debug)]
pub struct ZservCodec {
    version: u8,
}

impl ZservCodec {
    pub fn new(version: u8) -> Self {
        Self { version }
    }
}

impl Decoder for ZservCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Error> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if length < HEADER_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Frame length {} shorter than header", length),
            ));
        }
        if buf.len() < length {
            // Wait for the rest of the frame
            return Ok(None);
        }
        let frame = buf.split_to(length);
        let marker = frame[2];
        if marker != HEADER_MARKER {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Bad frame marker: {:#x}", marker),
            ));
        }
        let version = frame[3];
        let vrf_id = u16::from_be_bytes([frame[4], frame[5]]);
        let command = Command::from_code(u16::from_be_bytes([frame[6], frame[7]]));
        let data = &frame[HEADER_SIZE..];

        let body = match command {
            Command::Ipv4RouteAdd | Command::Ipv4RouteDelete => {
                Body::Route(RouteBody::decode(data, AFI::IPV4)?)
            }
            Command::Ipv6RouteAdd | Command::Ipv6RouteDelete => {
                Body::Route(RouteBody::decode(data, AFI::IPV6)?)
            }
            Command::NexthopUpdate => Body::NexthopUpdate(NexthopUpdateBody::decode(data)?),
            Command::NexthopRegister | Command::NexthopUnregister => {
                Body::NexthopRegister(NexthopRegisterBody::decode(data)?)
            }
            _ => {
                trace!("Decoded {} message as raw payload", command);
                Body::Unknown(data.to_vec())
            }
        };
        Ok(Some(Message {
            header: Header {
                length: length as u16,
                marker,
                version,
                vrf_id,
                command,
            },
            body,
        }))
    }
}

impl Encoder<Message> for ZservCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), Error> {
        let mut body = BytesMut::new();
        message.body.encode(&mut body);
        let length = HEADER_SIZE + body.len();
        buf.reserve(length);
        buf.put_u16(length as u16);
        buf.put_u8(HEADER_MARKER);
        buf.put_u8(self.version);
        buf.put_u16(message.header.vrf_id);
        buf.put_u16(message.header.command.code());
        buf.put_slice(&body);
        Ok(())
    }
}
