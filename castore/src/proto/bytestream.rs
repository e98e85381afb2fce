use tonic::{codegen::http::uri::PathAndQuery, transport::Channel};

use super::{WriteRequest, WriteResponse};

/// Client for the `google.bytestream.ByteStream` service, limited to the
/// client-streaming `Write` call used to upload blobs into a peer's CAS.
#[derive(Debug, Clone)]
pub struct ByteStreamClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ByteStreamClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn write(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = WriteRequest>,
    ) -> Result<tonic::Response<WriteResponse>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::new(
                tonic::Code::Unavailable,
                format!("Service was not ready: {}", e),
            )
        })?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/google.bytestream.ByteStream/Write");
        self.inner
            .client_streaming(request.into_streaming_request(), path, codec)
            .await
    }
}
