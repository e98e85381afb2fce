use bytes::Bytes;
use std::io;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{async_trait, transport::Channel, Response, Status};
use tracing::{instrument, warn};
use uuid::Uuid;

use super::{resource_name, BlobWrite, CasPeer};
use crate::{
    proto::{ByteStreamClient, WriteRequest, WriteResponse},
    Digest,
};

/// How many chunks may be in flight before [BlobWrite::write] waits.
const PENDING_CHUNKS: usize = 4;

/// Uploads blobs to a peer over the ByteStream `Write` RPC.
#[derive(Clone)]
pub struct GrpcCasPeer {
    /// Cloning it is cheap, and it internally handles concurrent requests.
    client: ByteStreamClient,
}

impl GrpcCasPeer {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: ByteStreamClient::new(channel),
        }
    }
}

#[async_trait]
impl CasPeer for GrpcCasPeer {
    async fn blob_write(&self, digest: &Digest, write_id: Uuid) -> io::Result<Box<dyn BlobWrite>> {
        Ok(Box::new(GrpcBlobWrite {
            client: self.client.clone(),
            resource_name: resource_name(digest, write_id),
            offset: 0,
            call: None,
        }))
    }
}

struct Call {
    tx: mpsc::Sender<WriteRequest>,
    task: JoinHandle<Result<Response<WriteResponse>, Status>>,
}

/// One upload. The RPC is started lazily with the first chunk, and
/// restarted from offset 0 after a [BlobWrite::reset].
pub struct GrpcBlobWrite {
    client: ByteStreamClient,
    resource_name: String,
    offset: u64,
    call: Option<Call>,
}

impl GrpcBlobWrite {
    fn call(&mut self) -> &mut Call {
        let client = &self.client;
        self.call.get_or_insert_with(|| {
            let (tx, rx) = mpsc::channel(PENDING_CHUNKS);
            let mut client = client.clone();
            let task = tokio::spawn(async move { client.write(ReceiverStream::new(rx)).await });
            Call { tx, task }
        })
    }

    /// Send one request on the call, surfacing the RPC's own error if the
    /// peer already hung up.
    async fn send(&mut self, request: WriteRequest) -> io::Result<()> {
        let call = self.call();
        if call.tx.send(request).await.is_ok() {
            return Ok(());
        }

        match self.finish().await {
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer closed the write early",
            )),
            Err(e) => Err(e),
        }
    }

    /// Close the request stream and wait for the response.
    async fn finish(&mut self) -> io::Result<WriteResponse> {
        let Call { tx, task } = self.call.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no write in progress")
        })?;
        drop(tx);

        match task.await? {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => Err(io::Error::other(status)),
        }
    }
}

#[async_trait]
impl BlobWrite for GrpcBlobWrite {
    async fn reset(&mut self) -> io::Result<()> {
        if let Some(call) = self.call.take() {
            call.task.abort();
        }
        self.offset = 0;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        let len = data.len() as u64;
        self.send(WriteRequest {
            resource_name: self.resource_name.clone(),
            write_offset: self.offset as i64,
            finish_write: false,
            data,
        })
        .await?;
        self.offset += len;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn commit(&mut self) -> io::Result<u64> {
        self.send(WriteRequest {
            resource_name: self.resource_name.clone(),
            write_offset: self.offset as i64,
            finish_write: true,
            data: Bytes::new(),
        })
        .await?;

        let response = self.finish().await?;
        if response.committed_size < 0 {
            warn!(committed_size = response.committed_size, "negative committed size");
        }
        Ok(response.committed_size.max(0) as u64)
    }
}

impl Drop for GrpcBlobWrite {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            call.task.abort();
        }
    }
}
