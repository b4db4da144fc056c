// Queue payload helpers shared by the relay, the sender, and client transports.
use bytes::Bytes;
use ferry_storage::DurableStore;
use ferry_wire::{BlobRef, Envelope, Frame, Message};
use tracing::warn;

use crate::Result;

/// Encodes `message` for a durable queue, spilling to `container` when the
/// encoded frame is larger than `inline_limit`.
pub async fn encode_for_queue(
    store: &dyn DurableStore,
    container: &str,
    message: &Message,
    inline_limit: usize,
) -> Result<Bytes> {
    let frame = message.encode()?.encode();
    if frame.len() <= inline_limit {
        return Ok(frame);
    }
    let blob = message.message_id.to_string();
    let length = frame.len() as u64;
    store.put_blob(container, &blob, frame).await?;
    let reference = BlobRef {
        container: container.to_string(),
        blob,
        length,
    };
    Ok(reference.encode()?.encode())
}

/// Turns a queue payload back into a message, fetching the blob if needed.
pub async fn decode_from_queue(store: &dyn DurableStore, payload: Bytes) -> Result<Message> {
    match Envelope::decode(payload)? {
        Envelope::Inline(message) => Ok(message),
        Envelope::Blob(reference) => read_blob(store, &reference).await,
    }
}

/// Like [`decode_from_queue`], but removes the blob once the message is read.
///
/// For consumers whose queue entry is already gone: nothing will read the
/// blob again. A failed delete is logged and does not fail the decode.
pub async fn take_from_queue(store: &dyn DurableStore, payload: Bytes) -> Result<Message> {
    match Envelope::decode(payload)? {
        Envelope::Inline(message) => Ok(message),
        Envelope::Blob(reference) => {
            let message = read_blob(store, &reference).await?;
            if let Err(err) = store
                .delete_blob(&reference.container, &reference.blob)
                .await
            {
                warn!(
                    container = %reference.container,
                    blob = %reference.blob,
                    error = %err,
                    "failed to delete consumed blob"
                );
            }
            Ok(message)
        }
    }
}

async fn read_blob(store: &dyn DurableStore, reference: &BlobRef) -> Result<Message> {
    let bytes = store.get_blob(&reference.container, &reference.blob).await?;
    Ok(Message::decode(Frame::decode(bytes)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_storage::MemoryStore;

    #[tokio::test]
    async fn small_messages_stay_inline() {
        let store = MemoryStore::new();
        let message = Message::request("c1", "Echo", Bytes::from_static(b"small"));
        let payload = encode_for_queue(&store, "blobs", &message, 4096)
            .await
            .expect("encode");
        assert!(matches!(
            Envelope::decode(payload.clone()).expect("envelope"),
            Envelope::Inline(_)
        ));
        let decoded = decode_from_queue(&store, payload).await.expect("decode");
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn large_messages_spill_to_blob() {
        let store = MemoryStore::new();
        store.create_container("blobs").await.expect("container");
        let message = Message::request("c1", "Echo", Bytes::from(vec![7u8; 2048]));
        let payload = encode_for_queue(&store, "blobs", &message, 256)
            .await
            .expect("encode");
        match Envelope::decode(payload.clone()).expect("envelope") {
            Envelope::Blob(reference) => {
                assert_eq!(reference.container, "blobs");
                assert_eq!(reference.blob, message.message_id.to_string());
            }
            other => panic!("expected blob reference, got {other:?}"),
        }
        let decoded = decode_from_queue(&store, payload).await.expect("decode");
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn taking_a_blob_message_removes_the_blob() {
        let store = MemoryStore::new();
        store.create_container("blobs").await.expect("container");
        let message = Message::request("c1", "Echo", Bytes::from(vec![3u8; 2048]));
        let payload = encode_for_queue(&store, "blobs", &message, 256)
            .await
            .expect("encode");
        let blob = message.message_id.to_string();

        let taken = take_from_queue(&store, payload).await.expect("take");
        assert_eq!(taken, message);
        assert!(matches!(
            store.get_blob("blobs", &blob).await,
            Err(ferry_storage::StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_blob_surfaces_storage_error() {
        let store = MemoryStore::new();
        store.create_container("blobs").await.expect("container");
        let reference = BlobRef {
            container: "blobs".into(),
            blob: "gone".into(),
            length: 1,
        };
        let payload = reference.encode().expect("encode").encode();
        let err = decode_from_queue(&store, payload).await.expect_err("missing");
        assert!(matches!(err, crate::BrokerError::Storage(_)));
    }
}
