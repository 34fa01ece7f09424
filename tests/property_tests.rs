//! Property-based tests using proptest
//!
//! Framing must not depend on how the byte stream was chunked by the network,
//! and queues must hand packets out in the order they were pushed.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use tokio_util::io::StreamReader;

use tcp_conduit::core::frame::Frame;
use tcp_conduit::core::queue::BoundedQueue;
use tcp_conduit::{ByteSource, ConduitError, FrameProtocol, Protocol};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn payloads() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..8)
}

/// Bytes that can never begin a frame.
fn noise() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>().prop_filter("not a magic start", |b| *b != b'T'), 0..8)
}

fn split(bytes: &[u8], sizes: &[usize]) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    let mut sizes = sizes.iter().cycle();
    while offset < bytes.len() {
        let size = (*sizes.next().unwrap()).min(bytes.len() - offset);
        chunks.push(Bytes::copy_from_slice(&bytes[offset..offset + size]));
        offset += size;
    }
    chunks
}

/// Drive `FrameProtocol` over a reader yielding `chunks` until end of stream.
async fn read_all(chunks: Vec<Bytes>, chunk_size: usize) -> Vec<Vec<u8>> {
    let stream = futures::stream::iter(chunks.into_iter().map(Ok::<_, io::Error>));
    let mut source = ByteSource::new(StreamReader::new(stream), chunk_size);
    let protocol = FrameProtocol;

    let mut out = Vec::new();
    loop {
        match protocol.read_packet(&mut source).await {
            Ok(frame) => out.push(frame.payload),
            Err(ConduitError::IncompleteFrame) => continue,
            Err(ConduitError::PeerClosed) => return out,
            Err(e) => panic!("unexpected framing error: {e}"),
        }
    }
}

proptest! {
    #[test]
    fn prop_decode_is_chunking_invariant(
        payloads in payloads(),
        sizes in prop::collection::vec(1usize..32, 1..8),
    ) {
        let mut wire = Vec::new();
        for payload in &payloads {
            wire.extend_from_slice(&Frame::new(payload.clone()).to_bytes());
        }

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in split(&wire, &sizes) {
            buf.extend_from_slice(&chunk);
            while let Some(frame) = Frame::decode(&mut buf).unwrap() {
                decoded.push(frame.payload);
            }
        }

        prop_assert_eq!(decoded, payloads);
        prop_assert!(buf.is_empty());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_protocol_skips_noise_regardless_of_chunking(
        frames in prop::collection::vec((noise(), prop::collection::vec(any::<u8>(), 0..64)), 0..6),
        sizes in prop::collection::vec(1usize..24, 1..6),
        read_chunk in 1usize..48,
    ) {
        let mut wire = Vec::new();
        for (garbage, payload) in &frames {
            wire.extend_from_slice(garbage);
            wire.extend_from_slice(&Frame::new(payload.clone()).to_bytes());
        }
        let expected: Vec<Vec<u8>> = frames.into_iter().map(|(_, payload)| payload).collect();

        let whole = runtime().block_on(read_all(vec![Bytes::from(wire.clone())], read_chunk));
        let chunked = runtime().block_on(read_all(split(&wire, &sizes), read_chunk));

        prop_assert_eq!(&whole, &expected);
        prop_assert_eq!(&chunked, &expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_queue_preserves_fifo_under_backpressure(
        items in prop::collection::vec(any::<u32>(), 0..200),
        capacity in 1usize..8,
    ) {
        let popped = runtime().block_on(async {
            let queue = Arc::new(BoundedQueue::new(capacity));
            let producer = {
                let queue = Arc::clone(&queue);
                let items = items.clone();
                tokio::spawn(async move {
                    for item in items {
                        queue.push(item).await.unwrap();
                    }
                })
            };

            let mut popped = Vec::with_capacity(items.len());
            for _ in 0..items.len() {
                popped.push(queue.pop().await.unwrap());
                assert!(queue.len() <= capacity);
            }
            producer.await.unwrap();
            popped
        });

        prop_assert_eq!(popped, items);
    }
}
