use crate::config::ProbeGeometry;
use crate::error::{NeuroLayerError, Result};

use ndarray::Array3;

/// Decodes little-endian i16 samples. A trailing odd byte is ignored.
pub fn decode_le_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Maps interleaved frames (channel-major within a frame, row then column) to
/// a (time, rows, cols) tensor.
pub fn reshape_samples(samples: Vec<i16>, geometry: &ProbeGeometry) -> Result<Array3<i16>> {
    let channels = geometry.channels();
    if channels == 0 || samples.len() % channels != 0 {
        return Err(NeuroLayerError::ShapeMismatch(format!(
            "{} samples do not form whole frames of {} channels",
            samples.len(),
            channels
        )));
    }
    let frames = samples.len() / channels;
    Ok(Array3::from_shape_vec(
        (frames, geometry.rows, geometry.cols),
        samples,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_little_endian() {
        let bytes = [0x01, 0x00, 0xff, 0xff, 0x00, 0x80, 0x07];
        assert_eq!(decode_le_i16(&bytes), vec![1, -1, i16::MIN]);
    }

    #[test]
    fn test_reshape_is_row_major() {
        let geometry = ProbeGeometry::new(2, 3, 1, 1).unwrap();
        let block = reshape_samples((0..12).collect(), &geometry).unwrap();
        assert_eq!(block.shape(), &[2, 2, 3]);
        assert_eq!(block[[0, 1, 0]], 3);
        assert_eq!(block[[1, 0, 2]], 8);
        assert_eq!(block[[1, 1, 2]], 11);
    }

    #[test]
    fn test_partial_frame_rejected() {
        let geometry = ProbeGeometry::new(2, 3, 1, 1).unwrap();
        assert!(matches!(
            reshape_samples(vec![0; 7], &geometry),
            Err(NeuroLayerError::ShapeMismatch(_))
        ));
    }
}
