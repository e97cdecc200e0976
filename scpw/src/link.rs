use crate::Error;
use remote::protocol::{self, ControlLine};
use tokio::io::AsyncWriteExt;

/// The two byte streams of one remote `scp`, owned by the task driving the protocol.
pub(crate) struct Link {
    pub reader: tokio::io::BufReader<remote::BoxedRead>,
    pub writer: remote::BoxedWrite,
}

impl Link {
    pub fn split(channel: remote::Channel) -> (Self, Box<dyn remote::RemoteProcess>) {
        let link = Self {
            reader: tokio::io::BufReader::with_capacity(protocol::CHUNK_SIZE, channel.reader),
            writer: channel.writer,
        };
        (link, channel.process)
    }

    /// Waits for one status byte from the peer.
    pub async fn response(&mut self) -> Result<(), Error> {
        Ok(protocol::read_response(&mut self.reader).await?)
    }

    pub async fn ack(&mut self) -> Result<(), Error> {
        Ok(protocol::send_ack(&mut self.writer).await?)
    }

    /// Sends a control line and waits for it to be acknowledged.
    pub async fn request(&mut self, line: &ControlLine) -> Result<(), Error> {
        protocol::send_line(&mut self.writer, line).await?;
        self.response().await
    }

    pub async fn read_line(&mut self) -> Result<Option<ControlLine>, Error> {
        Ok(protocol::read_line(&mut self.reader).await?)
    }

    /// Reports a local failure to the peer before the channel is dropped.
    pub async fn abort(&mut self, error: &Error) {
        if error.is_channel_loss() {
            return;
        }
        if let Err(send_error) = protocol::send_error(&mut self.writer, &error.to_string()).await {
            tracing::debug!("failed to report error to peer: {}", &send_error);
        }
    }

    /// Closes the input of the remote command.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.writer
            .shutdown()
            .await
            .map_err(|error| Error::from(protocol::Error::Channel(error)))
    }
}
