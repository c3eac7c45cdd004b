//! Binary encoding of images and masks sent over the broker.
//!
//! Layout: kind (u8), rows (u32 LE), cols (u32 LE), then row-major data:
//! little-endian f32 for images, one byte per pixel for masks.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array2;
use std::io::{Cursor, Read};

const KIND_IMAGE: u8 = 1;
const KIND_MASK: u8 = 2;
const HEADER_LEN: usize = 9;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: {0} bytes")]
    Truncated(usize),
    #[error("expected payload kind {expected}, found {found}")]
    Kind { expected: u8, found: u8 },
    #[error("payload holds {found} bytes of data, {rows}x{cols} needs {expected}")]
    Length {
        rows: usize,
        cols: usize,
        expected: usize,
        found: usize,
    },
    #[error("malformed control message: {0}")]
    Message(String),
}

fn header(kind: u8, rows: usize, cols: usize, data_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + data_len);
    out.push(kind);
    // Writes into a Vec cannot fail.
    let _ = out.write_u32::<LittleEndian>(rows as u32);
    let _ = out.write_u32::<LittleEndian>(cols as u32);
    out
}

pub fn encode_image(image: &Array2<f32>) -> Vec<u8> {
    let (rows, cols) = image.dim();
    let mut out = header(KIND_IMAGE, rows, cols, rows * cols * 4);
    for &value in image.iter() {
        let _ = out.write_f32::<LittleEndian>(value);
    }
    out
}

pub fn encode_mask(mask: &Array2<bool>) -> Vec<u8> {
    let (rows, cols) = mask.dim();
    let mut out = header(KIND_MASK, rows, cols, rows * cols);
    out.extend(mask.iter().map(|&m| u8::from(m)));
    out
}

fn read_header(
    cursor: &mut Cursor<&[u8]>,
    expected_kind: u8,
    bytes_per_pixel: usize,
) -> Result<(usize, usize), DecodeError> {
    let total = cursor.get_ref().len();
    let truncated = |_| DecodeError::Truncated(total);
    let kind = cursor.read_u8().map_err(truncated)?;
    if kind != expected_kind {
        return Err(DecodeError::Kind {
            expected: expected_kind,
            found: kind,
        });
    }
    let rows = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let cols = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let found = total - HEADER_LEN;
    let expected = rows
        .checked_mul(cols)
        .and_then(|pixels| pixels.checked_mul(bytes_per_pixel));
    let Some(expected) = expected else {
        return Err(DecodeError::Length {
            rows,
            cols,
            expected: usize::MAX,
            found,
        });
    };
    if expected != found {
        return Err(DecodeError::Length {
            rows,
            cols,
            expected,
            found,
        });
    }
    Ok((rows, cols))
}

pub fn decode_image(payload: &[u8]) -> Result<Array2<f32>, DecodeError> {
    let mut cursor = Cursor::new(payload);
    let (rows, cols) = read_header(&mut cursor, KIND_IMAGE, 4)?;
    let mut values = vec![0.0f32; rows * cols];
    cursor
        .read_f32_into::<LittleEndian>(&mut values)
        .map_err(|_| DecodeError::Truncated(payload.len()))?;
    Array2::from_shape_vec((rows, cols), values)
        .map_err(|err| DecodeError::Message(err.to_string()))
}

pub fn decode_mask(payload: &[u8]) -> Result<Array2<bool>, DecodeError> {
    let mut cursor = Cursor::new(payload);
    let (rows, cols) = read_header(&mut cursor, KIND_MASK, 1)?;
    let mut bytes = Vec::with_capacity(rows * cols);
    cursor
        .read_to_end(&mut bytes)
        .map_err(|_| DecodeError::Truncated(payload.len()))?;
    Array2::from_shape_vec((rows, cols), bytes.into_iter().map(|b| b != 0).collect())
        .map_err(|err| DecodeError::Message(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_keeps_nan_and_shape() {
        let mut image = Array2::from_shape_fn((3, 2), |(r, c)| (r * 2 + c) as f32);
        image[[1, 1]] = f32::NAN;
        let decoded = decode_image(&encode_image(&image)).unwrap();
        assert_eq!(decoded.dim(), (3, 2));
        assert_eq!(decoded[[2, 1]], 5.0);
        assert!(decoded[[1, 1]].is_nan());
    }

    #[test]
    fn mask_payload_is_not_an_image() {
        let mask = Array2::from_elem((2, 2), true);
        let payload = encode_mask(&mask);
        assert_eq!(decode_mask(&payload).unwrap(), mask);
        assert_eq!(
            decode_image(&payload).unwrap_err(),
            DecodeError::Kind {
                expected: KIND_IMAGE,
                found: KIND_MASK
            }
        );
    }

    #[test]
    fn rejects_truncated_payloads() {
        assert_eq!(decode_image(&[1, 0]).unwrap_err(), DecodeError::Truncated(2));
        let mut payload = encode_image(&Array2::zeros((2, 2)));
        payload.pop();
        assert!(matches!(
            decode_image(&payload),
            Err(DecodeError::Length { expected: 16, found: 15, .. })
        ));
    }

    #[test]
    fn oversized_header_is_a_length_error() {
        let header = [1, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            decode_image(&header),
            Err(DecodeError::Length { found: 0, .. })
        ));
        let mut mask = header;
        mask[0] = KIND_MASK;
        assert!(matches!(
            decode_mask(&mask),
            Err(DecodeError::Length { found: 0, .. })
        ));
    }
}
