use crate::{
    cmap::conn::{Connection, RawCommandResponse, StreamDescription},
    error::Result,
    hello::{hello_command, HelloReply},
    wire::OpQuery,
};

/// Performs the connection handshake: runs the initial `hello` exchange and derives the
/// connection's stream description from the reply.
///
/// The first exchange on a connection is framed as a legacy OP_QUERY, since the server's wire
/// version is not yet known; every subsequent command on the connection uses OP_MSG.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    app_name: Option<String>,
}

impl Handshaker {
    pub(crate) fn new(app_name: Option<String>) -> Self {
        Self { app_name }
    }

    pub(crate) async fn handshake(&self, conn: &mut Connection) -> Result<HelloReply> {
        let command = hello_command(None, self.app_name.as_deref(), None);
        let query = OpQuery::command(&command.target_db, command.body);

        let op_reply = conn.send_op_query(query).await?;
        let response =
            RawCommandResponse::new(conn.address().clone(), op_reply.into_command_response()?);
        let reply = response.into_hello_reply(conn.address().clone())?;

        conn.set_stream_description(StreamDescription::from_hello_reply(&reply));
        conn.server_id = reply.command_response.connection_id;
        Ok(reply)
    }
}
