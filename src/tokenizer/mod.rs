//! Text tokenization for llama-family GGUF models.
//!
//! Two encoders live behind one type, selected by `tokenizer.ggml.model`:
//!
//! - `llama`: SentencePiece-style, merging the adjacent pair whose
//!   concatenation has the highest vocabulary score.
//! - `gpt2`: byte-level BPE, merging the adjacent pair with the lowest
//!   rank in the merge table.
//!
//! Control tokens longer than two bytes are matched atomically before BPE
//! and never merge with surrounding text. Unknown symbols fall back to
//! `<0xNN>` byte tokens when the vocabulary carries them.

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use tracing::debug;

use crate::error::EngineError;
use crate::gguf::Gguf;

/// SentencePiece whitespace marker.
pub const SPACE_SYMBOL: char = '\u{2581}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerMode {
    SentencePiece,
    Gpt2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Normal,
    Unknown,
    Control,
    Byte,
}

impl TokenType {
    fn from_code(code: i64) -> Self {
        match code {
            2 => TokenType::Unknown,
            3 => TokenType::Control,
            6 => TokenType::Byte,
            _ => TokenType::Normal,
        }
    }
}

enum Segment<'a> {
    Text(&'a str),
    Special(u32),
}

#[derive(Debug)]
pub struct Tokenizer {
    mode: TokenizerMode,
    vocab: Vec<String>,
    lookup: HashMap<String, u32>,
    /// SentencePiece merge scores, indexed by token id.
    scores: Vec<f32>,
    /// GPT-2 merge table: "left right" -> rank.
    merge_rank: HashMap<String, u32>,
    types: Vec<TokenType>,
    /// Byte value -> id of its `<0xNN>` token, or -1.
    byte_id: [i32; 256],
    /// Control tokens longer than two bytes, matched atomically.
    specials: Vec<(String, u32)>,
    bos_id: i32,
    eos_id: i32,
    add_bos: bool,
    add_space_prefix: bool,
    /// GPT-2 printable-byte alphabet: byte value -> mapped character.
    byte_to_char: [char; 256],
    /// Reverse direction, used when decoding.
    char_to_byte: HashMap<char, u8>,
}

impl Tokenizer {
    pub fn from_gguf(gguf: &Gguf) -> Result<Self, EngineError> {
        let mode = match gguf.meta_str("tokenizer.ggml.model") {
            Some("llama") => TokenizerMode::SentencePiece,
            Some("gpt2") => TokenizerMode::Gpt2,
            Some(other) => {
                return Err(EngineError::InvalidVocabulary(format!(
                    "unknown tokenizer model {other:?}"
                )))
            }
            None => {
                return Err(EngineError::InvalidVocabulary(
                    "missing tokenizer.ggml.model".into(),
                ))
            }
        };

        let tokens = gguf
            .meta_str_array("tokenizer.ggml.tokens")
            .ok_or_else(|| EngineError::InvalidVocabulary("missing tokenizer.ggml.tokens".into()))?;
        let vocab: Vec<String> = tokens.iter().map(|s| s.to_string()).collect();

        let mut lookup = HashMap::with_capacity(vocab.len());
        for (i, tok) in vocab.iter().enumerate() {
            lookup.insert(tok.clone(), i as u32);
        }

        let types: Vec<TokenType> = match gguf.meta_i64_array("tokenizer.ggml.token_type") {
            Some(codes) => {
                let mut types: Vec<TokenType> =
                    codes.into_iter().map(TokenType::from_code).collect();
                types.resize(vocab.len(), TokenType::Normal);
                types
            }
            None => vec![TokenType::Normal; vocab.len()],
        };

        let scores = match mode {
            TokenizerMode::SentencePiece => {
                let mut scores = gguf.meta_f32_array("tokenizer.ggml.scores").ok_or_else(|| {
                    EngineError::InvalidVocabulary("sentencepiece model without scores".into())
                })?;
                scores.resize(vocab.len(), f32::NEG_INFINITY);
                scores
            }
            TokenizerMode::Gpt2 => Vec::new(),
        };

        let merge_rank = match mode {
            TokenizerMode::Gpt2 => {
                let merges = gguf.meta_str_array("tokenizer.ggml.merges").ok_or_else(|| {
                    EngineError::InvalidVocabulary("gpt2 model without merges".into())
                })?;
                merges
                    .iter()
                    .enumerate()
                    .map(|(rank, line)| (line.to_string(), rank as u32))
                    .collect()
            }
            TokenizerMode::SentencePiece => HashMap::new(),
        };

        let mut byte_id = [-1i32; 256];
        for b in 0..=255u8 {
            if let Some(&id) = lookup.get(format!("<0x{b:02X}>").as_str()) {
                byte_id[b as usize] = id as i32;
            }
        }

        let specials: Vec<(String, u32)> = vocab
            .iter()
            .zip(types.iter())
            .enumerate()
            .filter(|(_, (tok, ty))| **ty == TokenType::Control && tok.len() > 2)
            .map(|(i, (tok, _))| (tok.clone(), i as u32))
            .collect();

        let bos_id = gguf.meta_i64("tokenizer.ggml.bos_token_id").unwrap_or(-1) as i32;
        let eos_id = gguf.meta_i64("tokenizer.ggml.eos_token_id").unwrap_or(-1) as i32;
        let add_bos = gguf.meta_bool("tokenizer.ggml.add_bos_token").unwrap_or(true);
        let add_space_prefix = gguf
            .meta_bool("tokenizer.ggml.add_space_prefix")
            .unwrap_or(mode == TokenizerMode::SentencePiece);

        let (byte_to_char, char_to_byte) = build_byte_tables();

        debug!(
            ?mode,
            vocab = vocab.len(),
            specials = specials.len(),
            bos_id,
            eos_id,
            "built tokenizer"
        );

        Ok(Self {
            mode,
            vocab,
            lookup,
            scores,
            merge_rank,
            types,
            byte_id,
            specials,
            bos_id,
            eos_id,
            add_bos,
            add_space_prefix,
            byte_to_char,
            char_to_byte,
        })
    }

    pub fn mode(&self) -> TokenizerMode {
        self.mode
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn bos_id(&self) -> i32 {
        self.bos_id
    }

    pub fn eos_id(&self) -> i32 {
        self.eos_id
    }

    /// Whether the model was trained with a BOS token at sequence start.
    pub fn wants_bos(&self) -> bool {
        self.add_bos && self.bos_id >= 0
    }

    /// Encode text into token ids. With `add_bos` the BOS id is prepended
    /// when the vocabulary defines one.
    pub fn encode(&self, text: &str, add_bos: bool) -> Vec<u32> {
        let mut ids = Vec::new();
        if add_bos && self.bos_id >= 0 {
            ids.push(self.bos_id as u32);
        }
        if text.is_empty() {
            return ids;
        }

        let owned;
        let text = if self.mode == TokenizerMode::SentencePiece && self.add_space_prefix {
            owned = format!(" {text}");
            owned.as_str()
        } else {
            text
        };

        for segment in self.split_specials(text) {
            match segment {
                Segment::Special(id) => ids.push(id),
                Segment::Text(chunk) => match self.mode {
                    TokenizerMode::SentencePiece => self.encode_sp(chunk, &mut ids),
                    TokenizerMode::Gpt2 => self.encode_gpt2(chunk, &mut ids),
                },
            }
        }
        ids
    }

    /// Decode one id, appending its bytes to `out`. Control tokens and
    /// out-of-range ids produce nothing.
    pub fn decode_token(&self, id: u32, out: &mut Vec<u8>) {
        let Some(token) = self.vocab.get(id as usize) else {
            return;
        };
        if self.types[id as usize] == TokenType::Control {
            return;
        }
        if let Some(b) = parse_byte_token(token) {
            out.push(b);
            return;
        }
        match self.mode {
            TokenizerMode::SentencePiece => {
                let mut buf = [0u8; 4];
                for ch in token.chars() {
                    if ch == SPACE_SYMBOL {
                        out.push(b' ');
                    } else {
                        out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
            TokenizerMode::Gpt2 => {
                let mut buf = [0u8; 4];
                for ch in token.chars() {
                    match self.char_to_byte.get(&ch) {
                        Some(&b) => out.push(b),
                        None => out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes()),
                    }
                }
            }
        }
    }

    /// Decode a full id sequence, stripping the space synthesized by the
    /// encoder's prefix policy.
    pub fn decode(&self, ids: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        for &id in ids {
            self.decode_token(id, &mut out);
        }
        if self.mode == TokenizerMode::SentencePiece
            && self.add_space_prefix
            && out.first() == Some(&b' ')
        {
            out.remove(0);
        }
        out
    }

    fn split_specials<'a>(&self, text: &'a str) -> Vec<Segment<'a>> {
        let mut segments = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            // Earliest match wins; longest token on position ties.
            let mut best: Option<(usize, usize, u32)> = None;
            for (tok, id) in &self.specials {
                if let Some(pos) = rest.find(tok.as_str()) {
                    let better = match best {
                        None => true,
                        Some((bpos, blen, _)) => pos < bpos || (pos == bpos && tok.len() > blen),
                    };
                    if better {
                        best = Some((pos, tok.len(), *id));
                    }
                }
            }
            match best {
                Some((pos, len, id)) => {
                    if pos > 0 {
                        segments.push(Segment::Text(&rest[..pos]));
                    }
                    segments.push(Segment::Special(id));
                    rest = &rest[pos + len..];
                }
                None => {
                    segments.push(Segment::Text(rest));
                    break;
                }
            }
        }
        segments
    }

    fn encode_sp(&self, text: &str, ids: &mut Vec<u32>) {
        let text: String = text
            .chars()
            .map(|c| if c == ' ' { SPACE_SYMBOL } else { c })
            .collect();

        // Initial symbols: a codepoint if the vocabulary has it verbatim,
        // otherwise its UTF-8 bytes as <0xNN>.
        let mut symbols: Vec<String> = Vec::new();
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            let s: &str = ch.encode_utf8(&mut buf);
            if self.lookup.contains_key(s) {
                symbols.push(s.to_string());
            } else {
                for &b in s.as_bytes() {
                    symbols.push(format!("<0x{b:02X}>"));
                }
            }
        }

        // Greedy merge: the adjacent pair whose concatenation scores
        // highest, earliest index on ties.
        loop {
            let mut best: Option<(usize, f32)> = None;
            for i in 0..symbols.len().saturating_sub(1) {
                let merged = format!("{}{}", symbols[i], symbols[i + 1]);
                if let Some(&id) = self.lookup.get(merged.as_str()) {
                    let score = self.scores[id as usize];
                    if best.map_or(true, |(_, bs)| score > bs) {
                        best = Some((i, score));
                    }
                }
            }
            match best {
                Some((i, _)) => {
                    let right = symbols.remove(i + 1);
                    symbols[i].push_str(&right);
                }
                None => break,
            }
        }

        self.symbols_to_ids(&symbols, ids);
    }

    fn encode_gpt2(&self, text: &str, ids: &mut Vec<u32>) {
        // One symbol per input byte, expressed in the printable byte
        // alphabet the vocabulary and merge table are written in.
        let mut symbols: Vec<String> = text
            .as_bytes()
            .iter()
            .map(|&b| self.byte_to_char[b as usize].to_string())
            .collect();

        // Lowest-rank merge first, earliest index on ties.
        loop {
            let mut best: Option<(usize, u32)> = None;
            for i in 0..symbols.len().saturating_sub(1) {
                let key = format!("{} {}", symbols[i], symbols[i + 1]);
                if let Some(&rank) = self.merge_rank.get(key.as_str()) {
                    if best.map_or(true, |(_, br)| rank < br) {
                        best = Some((i, rank));
                    }
                }
            }
            match best {
                Some((i, _)) => {
                    let right = symbols.remove(i + 1);
                    symbols[i].push_str(&right);
                }
                None => break,
            }
        }

        self.symbols_to_ids(&symbols, ids);
    }

    fn symbols_to_ids(&self, symbols: &[String], ids: &mut Vec<u32>) {
        for sym in symbols {
            if let Some(&id) = self.lookup.get(sym.as_str()) {
                ids.push(id);
            } else if let Some(b) = parse_byte_token(sym) {
                // A byte symbol whose <0xNN> token is absent: route the
                // byte it stands for through the fallback table.
                self.push_byte(b, ids);
            } else {
                for &b in sym.as_bytes() {
                    self.push_byte(b, ids);
                }
            }
        }
    }

    fn push_byte(&self, b: u8, ids: &mut Vec<u32>) {
        let id = self.byte_id[b as usize];
        if id >= 0 {
            ids.push(id as u32);
        }
    }
}

/// Match the exact six-character `<0xNN>` byte-token pattern.
fn parse_byte_token(token: &str) -> Option<u8> {
    let bytes = token.as_bytes();
    if bytes.len() != 6 || !token.starts_with("<0x") || bytes[5] != b'>' {
        return None;
    }
    u8::from_str_radix(&token[3..5], 16).ok()
}

/// GPT-2 printable byte alphabet, both directions: bytes 33-126, 161-172
/// and 174-255 map to themselves; the remaining 68 bytes map, in order,
/// to codepoints 256..=323.
fn build_byte_tables() -> ([char; 256], HashMap<char, u8>) {
    let mut byte_to_char = ['\0'; 256];
    let mut char_to_byte = HashMap::with_capacity(256);

    let mut direct: Vec<u8> = Vec::new();
    direct.extend(33u8..=126);
    direct.extend(161u8..=172);
    direct.extend(174u8..=255);
    for &b in &direct {
        let c = char::from_u32(b as u32).unwrap();
        byte_to_char[b as usize] = c;
        char_to_byte.insert(c, b);
    }

    let mut next = 256u32;
    for b in 0..=255usize {
        if byte_to_char[b] == '\0' {
            let c = char::from_u32(next).unwrap();
            byte_to_char[b] = c;
            char_to_byte.insert(c, b as u8);
            next += 1;
        }
    }

    (byte_to_char, char_to_byte)
}
