//! Hilbert curve encoding for cell packing.
//!
//! The Hilbert curve maps 2-D or 3-D grid coordinates to a 1-D index
//! while preserving spatial locality, which makes it a good sort key for
//! grouping neighbouring data entries into cells. The 2-D encoding uses
//! the classic rotate-and-reflect walk whose curve starts at the lower
//! left corner of the grid and ends at the lower right one; the 3-D
//! encoding uses Skilling's transpose formulation.

use crate::envelope::Envelope;

/// Quantization order used for packing decisions. 16 bits per axis keeps
/// a 3-D index inside a `u64` while leaving plenty of resolution below
/// typical envelope extents.
pub const HILBERT_ORDER: u32 = 16;

/// Encodes a point in the unit square/cube to its Hilbert index.
///
/// Coordinates outside `[0, 1]` are clamped. `order` is the number of
/// bits per axis; `coords` must hold exactly two or three values.
pub fn hilbert_index(coords: &[f64], order: u32) -> u64 {
    debug_assert!(order > 0, "order must be positive");
    debug_assert!(
        coords.len() == 2 || coords.len() == 3,
        "only 2-D and 3-D are supported"
    );
    let n = 1u64 << order;
    let quantize = |v: f64| -> u64 {
        let v = v.clamp(0.0, 1.0);
        ((v * n as f64) as u64).min(n - 1)
    };
    match coords {
        [x, y] => xy2d(n, quantize(*x), quantize(*y)),
        [x, y, z] => {
            let mut axes = [quantize(*x), quantize(*y), quantize(*z)];
            axes_to_transpose(&mut axes, order);
            transpose_to_index(&axes, order)
        }
        _ => unreachable!(),
    }
}

/// Hilbert index of an envelope's center, normalized against `bounds`.
///
/// A zero-range axis in `bounds` maps to the low end of the grid so that
/// collinear points keep their along-axis ordering on the curve; centers
/// outside the bounds are clamped.
pub fn hilbert_of_center(envelope: &Envelope, bounds: &Envelope, order: u32) -> u64 {
    debug_assert_eq!(envelope.dim(), bounds.dim());
    let center = envelope.center();
    let mut norm = [0.0f64; 3];
    let axes = envelope.dim().axes();
    for i in 0..axes {
        let range = bounds.upper(i) - bounds.lower(i);
        norm[i] = if range > 0.0 {
            ((center[i] - bounds.lower(i)) / range).clamp(0.0, 1.0)
        } else {
            0.0
        };
    }
    hilbert_index(&norm[..axes], order)
}

/// Converts `(x, y)` grid coordinates to a distance along the 2-D curve.
fn xy2d(n: u64, mut x: u64, mut y: u64) -> u64 {
    let mut d = 0u64;
    let mut s = n / 2;
    while s > 0 {
        let rx = u64::from(x & s > 0);
        let ry = u64::from(y & s > 0);
        d += s * s * ((3 * rx) ^ ry);
        // Rotate/reflect so the sub-square's curve lines up. Only the
        // bits below `s` matter from here on, so the wrapping reflection
        // is safe even when stale high bits remain.
        if ry == 0 {
            if rx == 1 {
                x = s.wrapping_sub(1).wrapping_sub(x);
                y = s.wrapping_sub(1).wrapping_sub(y);
            }
            std::mem::swap(&mut x, &mut y);
        }
        s /= 2;
    }
    d
}

/// Skilling's in-place conversion from axis coordinates to the
/// "transposed" Hilbert representation.
fn axes_to_transpose(x: &mut [u64], order: u32) {
    let n = x.len();
    let m = 1u64 << (order - 1);

    // Inverse undo
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0u64;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for v in x.iter_mut() {
        *v ^= t;
    }
}

/// Interleaves transposed coordinates into a single index, most
/// significant bit of axis 0 first.
fn transpose_to_index(x: &[u64], order: u32) -> u64 {
    let mut d = 0u64;
    for b in (0..order).rev() {
        for v in x {
            d = (d << 1) | ((v >> b) & 1);
        }
    }
    d
}

/// Sort key for packing: the Hilbert value of an entry's center with the
/// entry id as a stable tiebreak, so splits are deterministic and
/// reproducible across identical insertion sequences.
pub fn packing_key(envelope: &Envelope, bounds: &Envelope, id: u64) -> (u64, u64) {
    (hilbert_of_center(envelope, bounds, HILBERT_ORDER), id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corners_are_distinct() {
        let mut d: Vec<u64> = [[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]]
            .iter()
            .map(|c| hilbert_index(c, 8))
            .collect();
        d.sort_unstable();
        d.dedup();
        assert_eq!(d.len(), 4, "corner indices should be unique");
    }

    #[test]
    fn test_origin_is_zero() {
        assert_eq!(hilbert_index(&[0.0, 0.0], 8), 0);
        assert_eq!(hilbert_index(&[0.0, 0.0, 0.0], 8), 0);
    }

    #[test]
    fn test_spatial_locality_2d() {
        let a = hilbert_index(&[0.5, 0.5], 8);
        let b = hilbert_index(&[0.50001, 0.50001], 8);
        assert!(a.abs_diff(b) < 1000, "nearby points should index nearby");
    }

    #[test]
    fn test_bottom_row_monotone() {
        // The curve starts at the lower-left cell and ends at the lower
        // right one, so indices along y=0 must increase with x. Cell
        // packing of collinear input relies on this.
        for order in [2u32, 4, 8, 16] {
            let mut prev = 0u64;
            for step in 0..32 {
                let x = step as f64 / 32.0;
                let d = hilbert_index(&[x, 0.0], order);
                assert!(d >= prev, "order {}: x={} went backwards", order, x);
                prev = d;
            }
        }
    }

    #[test]
    fn test_2d_grid_is_a_bijection() {
        let order = 3;
        let n = 1u64 << order;
        let mut seen: Vec<u64> = Vec::new();
        for xi in 0..n {
            for yi in 0..n {
                let x = (xi as f64 + 0.5) / n as f64;
                let y = (yi as f64 + 0.5) / n as f64;
                seen.push(hilbert_index(&[x, y], order));
            }
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), (n * n) as usize, "every cell visited once");
    }

    #[test]
    fn test_3d_grid_is_a_bijection() {
        let order = 2;
        let n = 1u64 << order;
        let mut seen: Vec<u64> = Vec::new();
        for xi in 0..n {
            for yi in 0..n {
                for zi in 0..n {
                    let c = [
                        (xi as f64 + 0.5) / n as f64,
                        (yi as f64 + 0.5) / n as f64,
                        (zi as f64 + 0.5) / n as f64,
                    ];
                    seen.push(hilbert_index(&c, order));
                }
            }
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), (n * n * n) as usize);
    }

    #[test]
    fn test_3d_adjacency() {
        // Consecutive indices along the 3-D curve must differ in exactly
        // one grid step; spot check by inverting over a small grid.
        let order = 2;
        let n = 1u64 << order;
        let mut by_index = vec![[0u64; 3]; (n * n * n) as usize];
        for xi in 0..n {
            for yi in 0..n {
                for zi in 0..n {
                    let mut axes = [xi, yi, zi];
                    axes_to_transpose(&mut axes, order);
                    let d = transpose_to_index(&axes, order);
                    by_index[d as usize] = [xi, yi, zi];
                }
            }
        }
        for w in by_index.windows(2) {
            let steps: u64 = (0..3).map(|i| w[0][i].abs_diff(w[1][i])).sum();
            assert_eq!(steps, 1, "curve must move one grid cell at a time");
        }
    }

    #[test]
    fn test_center_normalization() {
        let bounds = Envelope::rect(-100.0, -100.0, 100.0, 100.0).unwrap();
        let at_center = Envelope::point2(0.0, 0.0).unwrap();
        let direct = hilbert_index(&[0.5, 0.5], 8);
        assert_eq!(hilbert_of_center(&at_center, &bounds, 8), direct);
    }

    #[test]
    fn test_zero_range_axis_pins_low() {
        // Degenerate bounds on one axis must not scramble the ordering
        // of points spread along the other axis.
        let bounds = Envelope::rect(0.0, 5.0, 10.0, 5.0).unwrap();
        let mut prev = 0u64;
        for i in 0..=10 {
            let p = Envelope::point2(i as f64, 5.0).unwrap();
            let d = hilbert_of_center(&p, &bounds, 8);
            assert!(d >= prev);
            prev = d;
        }
    }

    #[test]
    fn test_packing_key_tiebreak() {
        let bounds = Envelope::rect(0.0, 0.0, 1.0, 1.0).unwrap();
        let p = Envelope::point2(0.25, 0.25).unwrap();
        let a = packing_key(&p, &bounds, 1);
        let b = packing_key(&p, &bounds, 2);
        assert_eq!(a.0, b.0);
        assert!(a < b, "equal Hilbert values break ties by id");
    }

    #[test]
    fn test_out_of_bounds_center_clamped() {
        let bounds = Envelope::rect(0.0, 0.0, 100.0, 100.0).unwrap();
        let outside = Envelope::point2(150.0, 150.0).unwrap();
        let corner = Envelope::point2(100.0, 100.0).unwrap();
        assert_eq!(
            hilbert_of_center(&outside, &bounds, 8),
            hilbert_of_center(&corner, &bounds, 8)
        );
    }
}
