use super::*;
use crate::testutil::GgufBuilder;

fn sp_tokenizer(tokens: &[&str], scores: &[f32], types: &[i32]) -> Tokenizer {
    let bytes = GgufBuilder::new()
        .string("tokenizer.ggml.model", "llama")
        .str_array("tokenizer.ggml.tokens", tokens)
        .f32_array("tokenizer.ggml.scores", scores)
        .i32_array("tokenizer.ggml.token_type", types)
        .u32("tokenizer.ggml.bos_token_id", 1)
        .u32("tokenizer.ggml.eos_token_id", 2)
        .bool_("tokenizer.ggml.add_bos_token", true)
        .build();
    Tokenizer::from_gguf(&Gguf::from_bytes(bytes).unwrap()).unwrap()
}

fn gpt2_tokenizer(tokens: &[&str], merges: &[&str], types: &[i32]) -> Tokenizer {
    let bytes = GgufBuilder::new()
        .string("tokenizer.ggml.model", "gpt2")
        .str_array("tokenizer.ggml.tokens", tokens)
        .str_array("tokenizer.ggml.merges", merges)
        .i32_array("tokenizer.ggml.token_type", types)
        .u32("tokenizer.ggml.eos_token_id", 0)
        .build();
    Tokenizer::from_gguf(&Gguf::from_bytes(bytes).unwrap()).unwrap()
}

/// Vocabulary with a full merge chain up to `▁hello`.
fn hello_tokenizer() -> Tokenizer {
    sp_tokenizer(
        &[
            "<unk>", "<s>", "</s>", "\u{2581}", "h", "e", "l", "o", "\u{2581}h", "\u{2581}he",
            "\u{2581}hel", "\u{2581}hell", "\u{2581}hello",
        ],
        &[
            0.0, 0.0, 0.0, -10.0, -10.0, -10.0, -10.0, -10.0, -5.0, -4.0, -3.0, -2.0, -1.0,
        ],
        &[2, 3, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
    )
}

#[test]
fn sp_merges_to_known_word() {
    let tok = hello_tokenizer();
    let ids = tok.encode("hello", true);
    assert_eq!(ids, vec![1, 12]);
}

#[test]
fn sp_decode_strips_synthetic_space() {
    let tok = hello_tokenizer();
    let ids = tok.encode("hello", true);
    assert_eq!(tok.decode(&ids), b"hello");
}

#[test]
fn sp_partial_merge_falls_back_to_pieces() {
    let tok = hello_tokenizer();
    // "hell" merges to ▁hell but never reaches ▁hello.
    let ids = tok.encode("hell", false);
    assert_eq!(ids, vec![11]);
    assert_eq!(tok.decode(&ids), b"hell");
}

#[test]
fn sp_byte_fallback() {
    let tok = sp_tokenizer(
        &["<unk>", "<s>", "</s>", "\u{2581}", "<0x41>", "<0x42>"],
        &[0.0, 0.0, 0.0, -1.0, 0.0, 0.0],
        &[2, 3, 3, 1, 6, 6],
    );
    // 'A' and 'B' are absent as codepoints; their bytes are covered.
    let ids = tok.encode("AB", false);
    assert_eq!(ids, vec![3, 4, 5]);
    assert_eq!(tok.decode(&ids), b"AB");
}

#[test]
fn sp_uncovered_byte_is_dropped() {
    let tok = sp_tokenizer(
        &["<unk>", "<s>", "</s>", "\u{2581}", "<0x41>"],
        &[0.0, 0.0, 0.0, -1.0, 0.0],
        &[2, 3, 3, 1, 6],
    );
    let ids = tok.encode("AZ", false);
    // Z has no byte token and no codepoint entry; encoding still succeeds.
    assert_eq!(ids, vec![3, 4]);
}

#[test]
fn sp_tie_breaks_by_earliest_index() {
    let tok = sp_tokenizer(
        &["<unk>", "<s>", "</s>", "a", "aa"],
        &[0.0, 0.0, 0.0, -2.0, -1.0],
        &[2, 3, 3, 1, 1],
    );
    // The synthetic leading space has no vocab or byte entry here and is
    // dropped; the four 'a's pair up left to right into two "aa" tokens.
    let ids = tok.encode("aaaa", false);
    assert_eq!(ids, vec![4, 4]);
}

#[test]
fn special_tokens_are_atomic() {
    let tok = hello_tokenizer();
    let ids = tok.encode("hello</s> hello", false);
    assert_eq!(ids, vec![12, 2, 12]);
}

#[test]
fn longest_special_wins_position_ties() {
    // "<|im|>" is a prefix of "<|im|>x", so both match at the same spot.
    let tok = sp_tokenizer(
        &["<unk>", "<|im|>", "<|im|>x", "a"],
        &[0.0, 0.0, 0.0, -1.0],
        &[2, 3, 3, 1],
    );
    let ids = tok.encode("<|im|>x", false);
    // The leading synthetic space has no vocab coverage and is dropped.
    assert_eq!(ids, vec![2]);
}

#[test]
fn gpt2_decode_roundtrip() {
    let tok = gpt2_tokenizer(
        &["Hello", "\u{120}world", "!"],
        &[],
        &[1, 1, 1],
    );
    let mut out = Vec::new();
    tok.decode_token(0, &mut out);
    tok.decode_token(1, &mut out);
    tok.decode_token(2, &mut out);
    assert_eq!(out, b"Hello world!");
}

#[test]
fn gpt2_merges_by_rank() {
    let tok = gpt2_tokenizer(
        &["a", "b", "c", "ab", "abc"],
        &["a b", "ab c"],
        &[1, 1, 1, 1, 1],
    );
    assert_eq!(tok.encode("abc", false), vec![4]);
    assert_eq!(tok.encode("cab", false), vec![2, 3]);
}

#[test]
fn gpt2_space_encodes_through_byte_alphabet() {
    // Real gpt2 vocabularies store the remapped byte forms; space (0x20)
    // appears as U+0120, never as a literal ' '.
    let tok = gpt2_tokenizer(
        &["\u{120}", "a", "b", "\u{120}a", "\u{120}ab"],
        &["\u{120} a", "\u{120}a b"],
        &[1, 1, 1, 1, 1],
    );
    let ids = tok.encode(" ab", false);
    assert_eq!(ids, vec![4]);
    assert_eq!(tok.decode(&ids), b" ab");
}

#[test]
fn gpt2_high_bytes_encode_through_byte_alphabet() {
    // 'é' is 0xC3 0xA9; both bytes sit in the direct Latin-1 range, so
    // the vocabulary carries them as 'Ã' and '©'.
    let tok = gpt2_tokenizer(&["Ã", "©", "Ã©"], &["Ã ©"], &[1, 1, 1]);
    let ids = tok.encode("é", false);
    assert_eq!(ids, vec![2]);
    assert_eq!(tok.decode(&ids), "é".as_bytes());
}

#[test]
fn gpt2_control_byte_encodes_through_byte_alphabet() {
    // Newline (0x0A) remaps to U+010A in the byte alphabet.
    let tok = gpt2_tokenizer(&["\u{10A}", "a"], &[], &[1, 1]);
    let ids = tok.encode("\na", false);
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(tok.decode(&ids), b"\na");
}

#[test]
fn gpt2_unknown_rune_passes_through() {
    let tok = gpt2_tokenizer(&["\u{2192}"], &[], &[1]);
    let mut out = Vec::new();
    tok.decode_token(0, &mut out);
    assert_eq!(out, "\u{2192}".as_bytes());
}

#[test]
fn decode_skips_control_and_out_of_range() {
    let tok = hello_tokenizer();
    let mut out = Vec::new();
    tok.decode_token(1, &mut out); // <s>
    tok.decode_token(2, &mut out); // </s>
    tok.decode_token(9999, &mut out);
    assert!(out.is_empty());
}

#[test]
fn byte_token_pattern_is_exact() {
    assert_eq!(parse_byte_token("<0x41>"), Some(0x41));
    assert_eq!(parse_byte_token("<0xff>"), Some(0xff));
    assert_eq!(parse_byte_token("<0x4>"), None);
    assert_eq!(parse_byte_token("<0x411>"), None);
    assert_eq!(parse_byte_token("x0x41>"), None);
    assert_eq!(parse_byte_token("hello!"), None);
}

#[test]
fn sentencepiece_without_scores_is_rejected() {
    let bytes = GgufBuilder::new()
        .string("tokenizer.ggml.model", "llama")
        .str_array("tokenizer.ggml.tokens", &["a"])
        .build();
    let err = Tokenizer::from_gguf(&Gguf::from_bytes(bytes).unwrap()).unwrap_err();
    assert!(matches!(err, EngineError::InvalidVocabulary(_)));
}

#[test]
fn gpt2_without_merges_is_rejected() {
    let bytes = GgufBuilder::new()
        .string("tokenizer.ggml.model", "gpt2")
        .str_array("tokenizer.ggml.tokens", &["a"])
        .build();
    let err = Tokenizer::from_gguf(&Gguf::from_bytes(bytes).unwrap()).unwrap_err();
    assert!(matches!(err, EngineError::InvalidVocabulary(_)));
}

#[test]
fn unknown_tokenizer_model_is_rejected() {
    let bytes = GgufBuilder::new()
        .string("tokenizer.ggml.model", "wordpiece")
        .str_array("tokenizer.ggml.tokens", &["a"])
        .build();
    let err = Tokenizer::from_gguf(&Gguf::from_bytes(bytes).unwrap()).unwrap_err();
    assert!(matches!(err, EngineError::InvalidVocabulary(_)));
}
