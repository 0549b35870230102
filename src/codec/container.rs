//! KTX2 and KTX 1.1 container writers.

use std::collections::BTreeMap;

use super::CodecError;
use crate::texture::BlockFormat;

pub const KTX2_IDENTIFIER: [u8; 12] = [
    0xAB, 0x4B, 0x54, 0x58, 0x20, 0x32, 0x30, 0xBB, 0x0D, 0x0A, 0x1A, 0x0A,
];
pub const KTX_IDENTIFIER: [u8; 12] = [
    0xAB, 0x4B, 0x54, 0x58, 0x20, 0x31, 0x31, 0xBB, 0x0D, 0x0A, 0x1A, 0x0A,
];

const KTX2_HEADER_LEN: usize = 80;
const KTX2_LEVEL_INDEX_ENTRY_LEN: usize = 24;
const KTX_ENDIANNESS: u32 = 0x0403_0201;

const SUPERCOMPRESSION_NONE: u32 = 0;
const SUPERCOMPRESSION_ZSTD: u32 = 2;

const KHR_DF_MODEL_BC7: u32 = 134;
const KHR_DF_MODEL_ETC2: u32 = 161;
const KHR_DF_PRIMARIES_BT709: u32 = 1;
const KHR_DF_TRANSFER_LINEAR: u32 = 1;
const KHR_DF_TRANSFER_SRGB: u32 = 2;

/// Block data of one texture, mip levels ordered largest first.
pub struct ContainerDesc<'a> {
    pub format: BlockFormat,
    pub srgb: bool,
    pub width: u32,
    pub height: u32,
    pub levels: &'a [Vec<u8>],
    /// Values are stored as given; text values carry their own NUL terminator.
    pub key_values: &'a BTreeMap<String, Vec<u8>>,
}

fn align(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn pad_to(out: &mut Vec<u8>, alignment: usize) {
    out.resize(align(out.len(), alignment), 0);
}

/// Basic data format descriptor with a single sample covering the whole block.
fn data_format_descriptor(format: BlockFormat, srgb: bool, supercompressed: bool) -> Vec<u8> {
    let (model, channel, bit_length) = match format {
        BlockFormat::Bc7RgbaUnorm => (KHR_DF_MODEL_BC7, 0u32, 127u32),
        BlockFormat::Etc1RgbUnorm => (KHR_DF_MODEL_ETC2, 2u32, 63u32),
    };
    let transfer = if srgb {
        KHR_DF_TRANSFER_SRGB
    } else {
        KHR_DF_TRANSFER_LINEAR
    };
    let bytes_plane0 = if supercompressed {
        0
    } else {
        format.block_size() as u32
    };

    let block_len = 24 + 16;
    let mut dfd = Vec::with_capacity(4 + block_len);
    push_u32(&mut dfd, (4 + block_len) as u32);
    // vendorId = 0 (Khronos), descriptorType = 0 (basic)
    push_u32(&mut dfd, 0);
    push_u32(&mut dfd, 2 | ((block_len as u32) << 16));
    push_u32(&mut dfd, model | (KHR_DF_PRIMARIES_BT709 << 8) | (transfer << 16));
    // 4x4 texel blocks, stored as dimension - 1
    push_u32(&mut dfd, 3 | (3 << 8));
    push_u32(&mut dfd, bytes_plane0);
    push_u32(&mut dfd, 0);

    push_u32(&mut dfd, (bit_length << 16) | (channel << 24));
    push_u32(&mut dfd, 0);
    push_u32(&mut dfd, 0);
    push_u32(&mut dfd, u32::MAX);
    dfd
}

fn key_value_data(key_values: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    let mut kvd = Vec::new();
    for (key, value) in key_values {
        push_u32(&mut kvd, (key.len() + 1 + value.len()) as u32);
        kvd.extend_from_slice(key.as_bytes());
        kvd.push(0);
        kvd.extend_from_slice(value);
        pad_to(&mut kvd, 4);
    }
    kvd
}

/// Writes a KTX2 file. With `zstd_level` set, every level is Zstandard supercompressed.
pub fn write_ktx2(desc: &ContainerDesc, zstd_level: Option<i32>) -> Result<Vec<u8>, CodecError> {
    let supercompressed = zstd_level.is_some();
    let level_count = desc.levels.len();

    let payloads = match zstd_level {
        Some(level) => desc
            .levels
            .iter()
            .map(|data| zstd_compress(level, data))
            .collect::<Result<Vec<_>, _>>()?,
        None => desc.levels.to_vec(),
    };

    let dfd = data_format_descriptor(desc.format, desc.srgb, supercompressed);
    let kvd = key_value_data(desc.key_values);

    let dfd_offset = KTX2_HEADER_LEN + KTX2_LEVEL_INDEX_ENTRY_LEN * level_count;
    let kvd_offset = dfd_offset + dfd.len();
    let level_alignment = if supercompressed {
        1
    } else {
        desc.format.block_size()
    };

    // Levels are laid out smallest first; the index stays ordered largest first.
    let mut cursor = kvd_offset + kvd.len();
    let mut offsets = vec![0usize; level_count];
    for index in (0..level_count).rev() {
        cursor = align(cursor, level_alignment);
        offsets[index] = cursor;
        cursor += payloads[index].len();
    }

    let mut out = Vec::with_capacity(cursor);
    out.extend_from_slice(&KTX2_IDENTIFIER);
    push_u32(&mut out, desc.format.vk_format(desc.srgb));
    push_u32(&mut out, 1);
    push_u32(&mut out, desc.width);
    push_u32(&mut out, desc.height);
    push_u32(&mut out, 0);
    push_u32(&mut out, 0);
    push_u32(&mut out, 1);
    push_u32(&mut out, level_count as u32);
    push_u32(
        &mut out,
        if supercompressed {
            SUPERCOMPRESSION_ZSTD
        } else {
            SUPERCOMPRESSION_NONE
        },
    );

    push_u32(&mut out, dfd_offset as u32);
    push_u32(&mut out, dfd.len() as u32);
    if kvd.is_empty() {
        push_u32(&mut out, 0);
        push_u32(&mut out, 0);
    } else {
        push_u32(&mut out, kvd_offset as u32);
        push_u32(&mut out, kvd.len() as u32);
    }
    push_u64(&mut out, 0);
    push_u64(&mut out, 0);

    for (index, payload) in payloads.iter().enumerate() {
        push_u64(&mut out, offsets[index] as u64);
        push_u64(&mut out, payload.len() as u64);
        push_u64(&mut out, desc.levels[index].len() as u64);
    }

    out.extend_from_slice(&dfd);
    out.extend_from_slice(&kvd);

    for index in (0..level_count).rev() {
        out.resize(offsets[index], 0);
        out.extend_from_slice(&payloads[index]);
    }

    Ok(out)
}

/// Writes a KTX 1.1 file.
pub fn write_ktx(desc: &ContainerDesc) -> Vec<u8> {
    let kvd = key_value_data(desc.key_values);

    let mut out = Vec::new();
    out.extend_from_slice(&KTX_IDENTIFIER);
    push_u32(&mut out, KTX_ENDIANNESS);
    // glType, glTypeSize, glFormat: compressed data
    push_u32(&mut out, 0);
    push_u32(&mut out, 1);
    push_u32(&mut out, 0);
    push_u32(&mut out, desc.format.gl_internal_format(desc.srgb));
    push_u32(&mut out, desc.format.gl_base_internal_format());
    push_u32(&mut out, desc.width);
    push_u32(&mut out, desc.height);
    push_u32(&mut out, 0);
    push_u32(&mut out, 0);
    push_u32(&mut out, 1);
    push_u32(&mut out, desc.levels.len() as u32);
    push_u32(&mut out, kvd.len() as u32);
    out.extend_from_slice(&kvd);

    for level in desc.levels {
        push_u32(&mut out, level.len() as u32);
        out.extend_from_slice(level);
        pad_to(&mut out, 4);
    }
    out
}

#[cfg(feature = "intel_tex_2")]
fn zstd_compress(level: i32, source: &[u8]) -> Result<Vec<u8>, CodecError> {
    use std::ffi::c_void;
    use zstd_sys::*;

    let bound = unsafe { ZSTD_compressBound(source.len()) };
    let mut destination = vec![0u8; bound];
    let result = unsafe {
        ZSTD_compress(
            destination.as_mut_ptr() as *mut c_void,
            destination.len(),
            source.as_ptr() as *const c_void,
            source.len(),
            level,
        )
    };

    if unsafe { ZSTD_isError(result) } != 0 {
        let name = unsafe { std::ffi::CStr::from_ptr(ZSTD_getErrorName(result)) };
        return Err(CodecError::Supercompression(
            name.to_string_lossy().into_owned(),
        ));
    }
    destination.truncate(result);
    Ok(destination)
}

#[cfg(not(feature = "intel_tex_2"))]
fn zstd_compress(_level: i32, _source: &[u8]) -> Result<Vec<u8>, CodecError> {
    Err(CodecError::Unsupported(
        "Zstandard supercompression requires the intel_tex_2 feature".to_owned(),
    ))
}
