//! GGUF container parsing.
//!
//! A GGUF file is little-endian throughout: magic `GGUF`, a 32-bit
//! version, tensor and metadata counts, the metadata key/value store, the
//! tensor directory, then the tensor data region aligned to
//! `general.alignment` (default 32). Versions 2 and 3 are accepted; the
//! layout is identical for the subset of types used here.
//!
//! The file is either memory-mapped read-only or parsed from an owned
//! buffer; both live behind [`Store`] so tests can build containers
//! in memory.

mod tensor;
#[cfg(test)]
mod tests;
mod value;

pub use tensor::{Dtype, TensorInfo, TensorView};
pub use value::MetaValue;

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::Mmap;
use tracing::debug;

use crate::error::EngineError;

pub const MAGIC: &[u8; 4] = b"GGUF";
const DEFAULT_ALIGNMENT: usize = 32;

#[derive(Debug)]
enum Store {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Store {
    fn bytes(&self) -> &[u8] {
        match self {
            Store::Owned(buf) => buf,
            Store::Mapped(map) => map,
        }
    }
}

/// A parsed GGUF container: metadata store, tensor directory and the raw
/// tensor data region.
#[derive(Debug)]
pub struct Gguf {
    pub version: u32,
    metadata: HashMap<String, MetaValue>,
    tensors: Vec<TensorInfo>,
    index: HashMap<String, usize>,
    store: Store,
    data_base: usize,
}

impl Gguf {
    /// Memory-map and parse a GGUF file.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let file = File::open(path)?;
        // The map stays alive as long as this struct; tensor views borrow
        // from it read-only.
        let map = unsafe { Mmap::map(&file)? };
        Self::parse(Store::Mapped(map))
    }

    /// Parse a GGUF container from an owned byte buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, EngineError> {
        Self::parse(Store::Owned(bytes))
    }

    fn parse(store: Store) -> Result<Self, EngineError> {
        let data = store.bytes();
        let mut rd = Reader { data, pos: 0 };

        if rd.bytes(4)? != MAGIC {
            return Err(EngineError::InvalidContainer("bad magic".into()));
        }
        let version = rd.u32()?;
        if !(2..=3).contains(&version) {
            return Err(EngineError::InvalidContainer(format!(
                "unsupported version {version}"
            )));
        }
        let n_tensors = rd.u64()? as usize;
        let n_meta = rd.u64()? as usize;

        let mut metadata = HashMap::with_capacity(n_meta.min(4096));
        for _ in 0..n_meta {
            let key = rd.string()?;
            let value = rd.value()?;
            metadata.insert(key, value);
        }

        let mut tensors = Vec::with_capacity(n_tensors.min(4096));
        let mut index = HashMap::with_capacity(n_tensors.min(4096));
        for _ in 0..n_tensors {
            let info = rd.tensor_info()?;
            index.insert(info.name.clone(), tensors.len());
            tensors.push(info);
        }

        let alignment = metadata
            .get("general.alignment")
            .and_then(MetaValue::as_u64)
            .map(|a| a as usize)
            .unwrap_or(DEFAULT_ALIGNMENT);
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(EngineError::InvalidContainer(format!(
                "bad alignment {alignment}"
            )));
        }
        let data_base = (rd.pos + alignment - 1) & !(alignment - 1);
        if data_base > data.len() {
            return Err(truncated());
        }

        // Every directory entry must fit inside the data region.
        let region = data.len() - data_base;
        for info in &tensors {
            let size = info.byte_size()?;
            if info.offset + size > region {
                return Err(truncated());
            }
        }

        debug!(
            version,
            tensors = tensors.len(),
            metadata = metadata.len(),
            alignment,
            "parsed gguf container"
        );

        Ok(Self {
            version,
            metadata,
            tensors,
            index,
            store,
            data_base,
        })
    }

    pub fn metadata(&self) -> &HashMap<String, MetaValue> {
        &self.metadata
    }

    pub fn meta(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.meta(key).and_then(MetaValue::as_u64)
    }

    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        self.meta(key).and_then(MetaValue::as_i64)
    }

    pub fn meta_f32(&self, key: &str) -> Option<f32> {
        self.meta(key).and_then(MetaValue::as_f32)
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.meta(key).and_then(MetaValue::as_bool)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta(key).and_then(MetaValue::as_str)
    }

    pub fn meta_str_array(&self, key: &str) -> Option<Vec<&str>> {
        self.meta(key)?
            .as_array()?
            .iter()
            .map(MetaValue::as_str)
            .collect()
    }

    pub fn meta_f32_array(&self, key: &str) -> Option<Vec<f32>> {
        self.meta(key)?
            .as_array()?
            .iter()
            .map(MetaValue::as_f32)
            .collect()
    }

    pub fn meta_i64_array(&self, key: &str) -> Option<Vec<i64>> {
        self.meta(key)?
            .as_array()?
            .iter()
            .map(MetaValue::as_i64)
            .collect()
    }

    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.index.get(name).map(|&i| &self.tensors[i])
    }

    /// Borrow the bytes of one tensor as a typed view. The range was
    /// validated during parse.
    pub fn view(&self, info: &TensorInfo) -> TensorView<'_> {
        let start = self.data_base + info.offset;
        let size = info.dtype.row_bytes(info.cols()) * info.rows();
        TensorView {
            dtype: info.dtype,
            rows: info.rows(),
            cols: info.cols(),
            data: &self.store.bytes()[start..start + size],
        }
    }
}

fn truncated() -> EngineError {
    EngineError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "truncated gguf file",
    ))
}

// Metadata value type tags, per the container format.
const T_U8: u32 = 0;
const T_I8: u32 = 1;
const T_U16: u32 = 2;
const T_I16: u32 = 3;
const T_U32: u32 = 4;
const T_I32: u32 = 5;
const T_F32: u32 = 6;
const T_BOOL: u32 = 7;
const T_STRING: u32 = 8;
const T_ARRAY: u32 = 9;
const T_U64: u32 = 10;
const T_I64: u32 = 11;
const T_F64: u32 = 12;

/// Bounds-checked little-endian cursor over the raw file.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], EngineError> {
        if len > self.data.len() - self.pos {
            return Err(truncated());
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, EngineError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EngineError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, EngineError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, EngineError> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self) -> Result<String, EngineError> {
        let len = self.u64()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| EngineError::InvalidContainer("non-utf8 string".into()))
    }

    fn value(&mut self) -> Result<MetaValue, EngineError> {
        let tag = self.u32()?;
        self.value_of(tag)
    }

    fn value_of(&mut self, tag: u32) -> Result<MetaValue, EngineError> {
        Ok(match tag {
            T_U8 => MetaValue::U8(self.u8()?),
            T_I8 => MetaValue::I8(self.u8()? as i8),
            T_U16 => MetaValue::U16(self.u16()?),
            T_I16 => MetaValue::I16(self.u16()? as i16),
            T_U32 => MetaValue::U32(self.u32()?),
            T_I32 => MetaValue::I32(self.u32()? as i32),
            T_F32 => MetaValue::F32(f32::from_bits(self.u32()?)),
            T_BOOL => MetaValue::Bool(self.u8()? != 0),
            T_STRING => MetaValue::String(self.string()?),
            T_U64 => MetaValue::U64(self.u64()?),
            T_I64 => MetaValue::I64(self.u64()? as i64),
            T_F64 => MetaValue::F64(f64::from_bits(self.u64()?)),
            T_ARRAY => {
                let elem_tag = self.u32()?;
                let len = self.u64()? as usize;
                // Each element occupies at least one byte.
                if len > self.data.len() - self.pos {
                    return Err(truncated());
                }
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.value_of(elem_tag)?);
                }
                MetaValue::Array(items)
            }
            other => {
                return Err(EngineError::InvalidContainer(format!(
                    "unknown metadata value type {other}"
                )))
            }
        })
    }

    fn tensor_info(&mut self) -> Result<TensorInfo, EngineError> {
        let name = self.string()?;
        let n_dims = self.u32()? as usize;
        if n_dims > 4 {
            return Err(EngineError::InvalidContainer(format!(
                "tensor {name} has {n_dims} dimensions"
            )));
        }
        let mut dims = Vec::with_capacity(n_dims);
        for _ in 0..n_dims {
            dims.push(self.u64()? as usize);
        }
        let code = self.u32()?;
        let dtype = Dtype::from_code(code).ok_or_else(|| EngineError::InvalidTensor {
            name: name.clone(),
            reason: format!("unsupported dtype code {code}"),
        })?;
        let offset = self.u64()? as usize;
        Ok(TensorInfo {
            name,
            dims,
            dtype,
            offset,
        })
    }
}
