use std::io::Write;

use super::*;
use crate::testutil::GgufBuilder;

fn basic_container() -> Vec<u8> {
    GgufBuilder::new()
        .string("general.architecture", "llama")
        .u32("llama.block_count", 4)
        .f32("llama.rope.freq_base", 10000.0)
        .bool_("tokenizer.ggml.add_bos_token", true)
        .str_array("tokenizer.ggml.tokens", &["<s>", "a", "b"])
        .f32_array("tokenizer.ggml.scores", &[0.0, -1.0, -2.0])
        .i32_array("tokenizer.ggml.token_type", &[3, 1, 1])
        .tensor_f32("weights", &[4, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])
        .build()
}

#[test]
fn parses_metadata_and_tensors() {
    let gguf = Gguf::from_bytes(basic_container()).unwrap();
    assert_eq!(gguf.version, 3);
    assert_eq!(gguf.meta_str("general.architecture"), Some("llama"));
    assert_eq!(gguf.meta_u64("llama.block_count"), Some(4));
    assert_eq!(gguf.meta_f32("llama.rope.freq_base"), Some(10000.0));
    assert_eq!(gguf.meta_bool("tokenizer.ggml.add_bos_token"), Some(true));
    assert_eq!(
        gguf.meta_str_array("tokenizer.ggml.tokens"),
        Some(vec!["<s>", "a", "b"])
    );
    assert_eq!(
        gguf.meta_f32_array("tokenizer.ggml.scores"),
        Some(vec![0.0, -1.0, -2.0])
    );
    assert_eq!(
        gguf.meta_i64_array("tokenizer.ggml.token_type"),
        Some(vec![3, 1, 1])
    );

    let info = gguf.tensor("weights").unwrap();
    assert_eq!(info.dims, vec![4, 2]);
    assert_eq!(info.cols(), 4);
    assert_eq!(info.rows(), 2);
    assert_eq!(info.dtype, Dtype::F32);

    let view = gguf.view(info);
    let values = view.to_f32_vec();
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
}

#[test]
fn accepts_version_2() {
    let bytes = GgufBuilder::new().version(2).u32("k", 9).build();
    let gguf = Gguf::from_bytes(bytes).unwrap();
    assert_eq!(gguf.version, 2);
    assert_eq!(gguf.meta_u64("k"), Some(9));
}

#[test]
fn rejects_bad_magic() {
    let mut bytes = basic_container();
    bytes[0] = b'X';
    assert!(matches!(
        Gguf::from_bytes(bytes),
        Err(EngineError::InvalidContainer(_))
    ));
}

#[test]
fn rejects_unknown_version() {
    let bytes = GgufBuilder::new().version(7).build();
    assert!(matches!(
        Gguf::from_bytes(bytes),
        Err(EngineError::InvalidContainer(_))
    ));
}

#[test]
fn rejects_truncated_file() {
    let bytes = basic_container();
    let cut = bytes.len() - 8;
    assert!(matches!(
        Gguf::from_bytes(bytes[..cut].to_vec()),
        Err(EngineError::Io(_))
    ));
}

#[test]
fn rejects_truncated_metadata() {
    let full = GgufBuilder::new().u32("some.key", 1).build();
    // Cut inside the metadata section.
    assert!(Gguf::from_bytes(full[..20].to_vec()).is_err());
}

#[test]
fn rejects_unsupported_tensor_dtype() {
    // Q8_0 (code 8) is outside the supported set.
    let bytes = GgufBuilder::new()
        .tensor_raw("t", &[32, 1], 8, vec![0u8; 34])
        .build();
    assert!(matches!(
        Gguf::from_bytes(bytes),
        Err(EngineError::InvalidTensor { .. })
    ));
}

#[test]
fn rejects_ragged_q4_0_tensor() {
    let bytes = GgufBuilder::new()
        .tensor_raw("t", &[40, 1], 2, vec![0u8; 18])
        .build();
    assert!(matches!(
        Gguf::from_bytes(bytes),
        Err(EngineError::InvalidTensor { .. })
    ));
}

#[test]
fn nested_and_scalar_value_types_roundtrip() {
    // Exercise the full scalar palette through the raw encoder.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"GGUF");
    bytes.extend_from_slice(&3u32.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(&1u64.to_le_bytes());
    // key "nested"
    bytes.extend_from_slice(&6u64.to_le_bytes());
    bytes.extend_from_slice(b"nested");
    // array of arrays of u8
    bytes.extend_from_slice(&9u32.to_le_bytes()); // array
    bytes.extend_from_slice(&9u32.to_le_bytes()); // elem: array
    bytes.extend_from_slice(&2u64.to_le_bytes());
    for _ in 0..2 {
        bytes.extend_from_slice(&0u32.to_le_bytes()); // elem: u8
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.push(1);
        bytes.push(2);
    }
    let gguf = Gguf::from_bytes(bytes).unwrap();
    let outer = gguf.meta("nested").unwrap().as_array().unwrap();
    assert_eq!(outer.len(), 2);
    assert_eq!(
        outer[0].as_array().unwrap(),
        &[MetaValue::U8(1), MetaValue::U8(2)]
    );
}

#[test]
fn mmap_roundtrip() {
    let bytes = basic_container();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();

    let gguf = Gguf::open(file.path()).unwrap();
    assert_eq!(gguf.meta_str("general.architecture"), Some("llama"));
    let view = gguf.view(gguf.tensor("weights").unwrap());
    assert_eq!(view.to_f32_vec()[3], 4.0);
}

#[test]
fn missing_file_is_io_error() {
    let err = Gguf::open(std::path::Path::new("/nonexistent/model.gguf")).unwrap_err();
    assert!(matches!(err, EngineError::Io(_)));
}
