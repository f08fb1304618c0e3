//! The MongoDB wire protocol: message headers, OP_MSG framing, the legacy OP_QUERY/OP_REPLY
//! pair, and request-id assignment.

mod header;
mod legacy;
mod message;
mod util;

pub(crate) use self::{
    header::{Header, OpCode},
    legacy::{OpQuery, OpReply},
    message::{DocumentSequence, Message, MessageFlags},
    util::next_request_id,
};
