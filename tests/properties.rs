//! Property-based tests for chunking and host/device transfers.

use accel_media::{
    aggregate_linear, aggregate_windowed, extract, stretched_hop, AcceleratorSession, ChunkLayout, HostBackend,
    HostData, SessionConfig,
};
use proptest::prelude::*;
use rustfft::num_complex::Complex;

fn session() -> AcceleratorSession<HostBackend> {
    let mut session = AcceleratorSession::new(HostBackend::new());
    session.initialize(&SessionConfig::default()).unwrap();
    session
}

fn host_data() -> impl Strategy<Value = HostData> {
    prop_oneof![
        prop::collection::vec(any::<f32>(), 0..128).prop_map(HostData::Real32),
        prop::collection::vec((any::<f32>(), any::<f32>()), 0..64)
            .prop_map(|v| HostData::Complex32(v.into_iter().map(|(re, im)| Complex::new(re, im)).collect())),
        prop::collection::vec((any::<f64>(), any::<f64>()), 0..32)
            .prop_map(|v| HostData::Complex64(v.into_iter().map(|(re, im)| Complex::new(re, im)).collect())),
        prop::collection::vec(any::<u8>(), 0..256).prop_map(HostData::Byte),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Without overlap, reconstruction returns the signal truncated to whole chunks.
    #[test]
    fn linear_round_trip_without_overlap(
        x in prop::collection::vec(-1.0f32..=1.0f32, 0..2000),
        chunk_size in 1usize..200,
    ) {
        let chunks = extract(&x, chunk_size, 0.0);
        let y = aggregate_linear(&chunks, chunk_size, 0);

        prop_assert_eq!(y.len(), x.len() / chunk_size * chunk_size);
        prop_assert_eq!(&y[..], &x[..y.len()]);
    }

    /// With overlap, every covered sample is reconstructed.
    #[test]
    fn linear_round_trip_with_overlap(
        x in prop::collection::vec(-1.0f32..=1.0f32, 0..2000),
        chunk_size in 1usize..200,
        overlap in 0.0f32..0.95,
    ) {
        let layout = ChunkLayout::new(chunk_size, overlap).unwrap();
        let chunks = extract(&x, chunk_size, overlap);
        let y = aggregate_linear(&chunks, layout.chunk_size, layout.overlap_size);

        prop_assert_eq!(Some(y.len()), layout.output_len(chunks.len(), layout.hop()));
        for (a, b) in x.iter().zip(&y) {
            prop_assert!((a - b).abs() < 1e-5);
        }
    }

    /// Windowed output length follows the stretched hop.
    #[test]
    fn windowed_output_length(
        count in 1usize..20,
        chunk_size in 2usize..256,
        overlap in 0.0f32..0.9,
        stretch in 0.25f64..4.0,
    ) {
        let layout = ChunkLayout::new(chunk_size, overlap).unwrap();
        let chunks = vec![vec![0.25f32; chunk_size]; count];

        let y = aggregate_windowed(&chunks, chunk_size, layout.overlap_size, stretch);

        let hop = stretched_hop(layout.hop(), stretch);
        prop_assert_eq!(y.len(), (count - 1) * hop + chunk_size);
        // A constant signal stays constant wherever any window has weight.
        prop_assert!(y.iter().all(|&v| v == 0.0 || (v - 0.25).abs() < 1e-5));
    }

    /// Push then pull returns the exact bytes for every element kind.
    #[test]
    fn push_pull_is_bit_exact(data in host_data()) {
        let mut session = session();
        let before = session.usage();

        let handle = session.push(&data).unwrap();
        if data.is_empty() {
            prop_assert!(handle.is_null());
            prop_assert_eq!(session.usage(), before);
        } else {
            prop_assert_eq!(session.registry().size_of(handle), data.to_bytes().len() as u64);
            let pulled = session.pull(handle, true);
            prop_assert_eq!(pulled.kind(), data.kind());
            prop_assert_eq!(pulled.to_bytes(), data.to_bytes());
            prop_assert!(session.registry().is_empty());
        }
    }
}
