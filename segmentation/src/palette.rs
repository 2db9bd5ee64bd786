//! Class-index maps to color images for the logging sink.

use ndarray::{Array3, Array4};

/// The classic VOC color map: bit-interleaved, stable per class index.
pub fn voc_colormap(num_classes: usize) -> Vec<[u8; 3]> {
    (0..num_classes)
        .map(|i| {
            let mut c = i;
            let mut rgb = [0u8; 3];
            for shift in (0..8).rev() {
                rgb[0] |= ((c & 1) << shift) as u8;
                rgb[1] |= (((c >> 1) & 1) << shift) as u8;
                rgb[2] |= (((c >> 2) & 1) << shift) as u8;
                c >>= 3;
            }
            rgb
        })
        .collect()
}

/// Decodes class maps `[N, H, W]` into RGB batches `[N, 3, H, W]`.
///
/// Indices outside the palette (including `ignore_index`) are painted
/// with `ignore_color`.
pub fn decode_segmap(
    maps: &Array3<i64>,
    palette: &[[u8; 3]],
    ignore_index: i64,
    ignore_color: [u8; 3],
) -> Array4<u8> {
    let (n, h, w) = maps.dim();
    Array4::from_shape_fn((n, 3, h, w), |(ni, ch, hi, wi)| {
        let class = maps[[ni, hi, wi]];
        if class == ignore_index || class < 0 || class as usize >= palette.len() {
            ignore_color[ch]
        } else {
            palette[class as usize][ch]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voc_colormap_first_entries() {
        let palette = voc_colormap(4);
        assert_eq!(palette[0], [0, 0, 0]);
        assert_eq!(palette[1], [128, 0, 0]);
        assert_eq!(palette[2], [0, 128, 0]);
        assert_eq!(palette[3], [128, 128, 0]);
    }

    #[test]
    fn decode_paints_classes_and_ignore() {
        let maps = ndarray::arr3(&[[[0i64, 1], [255, 2]]]);
        let palette = voc_colormap(3);
        let rgb = decode_segmap(&maps, &palette, 255, [255, 255, 255]);

        assert_eq!(rgb.dim(), (1, 3, 2, 2));
        // Class 1 pixel.
        assert_eq!(rgb[[0, 0, 0, 1]], 128);
        assert_eq!(rgb[[0, 1, 0, 1]], 0);
        // Ignored pixel is white.
        for ch in 0..3 {
            assert_eq!(rgb[[0, ch, 1, 0]], 255);
        }
    }
}
