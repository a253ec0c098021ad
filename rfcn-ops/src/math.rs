//! Dense matrix multiply used to turn column buffers into convolution outputs.

use rayon::prelude::*;

/// Whether an operand is read transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    No,
    Yes,
}

/// `c = alpha * op(a) * op(b) + beta * c` on row-major buffers.
///
/// `op(a)` is `m x k`, `op(b)` is `k x n` and `c` is `m x n`. With
/// `Transpose::Yes` the operand is stored as the transposed matrix
/// (`k x m` for `a`, `n x k` for `b`). Rows of `c` are computed in parallel.
#[allow(clippy::too_many_arguments)]
pub fn gemm(
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    c: &mut [f32],
) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(c.len(), m * n);
    if m == 0 || n == 0 {
        return;
    }

    c.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        if beta == 0.0 {
            row.fill(0.0);
        } else if beta != 1.0 {
            row.iter_mut().for_each(|v| *v *= beta);
        }
        for p in 0..k {
            let a_ip = match trans_a {
                Transpose::No => a[i * k + p],
                Transpose::Yes => a[p * m + i],
            } * alpha;
            if a_ip == 0.0 {
                continue;
            }
            match trans_b {
                Transpose::No => {
                    let b_row = &b[p * n..(p + 1) * n];
                    row.iter_mut().zip(b_row).for_each(|(out, &b_pj)| *out += a_ip * b_pj);
                }
                Transpose::Yes => {
                    row.iter_mut()
                        .enumerate()
                        .for_each(|(j, out)| *out += a_ip * b[j * k + p]);
                }
            }
        }
    });
}
