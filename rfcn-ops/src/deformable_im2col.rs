//! # Deformable Column Transform
//!
//! `deformable_im2col` lays an image out as a `(channels * kh * kw, out_h * out_w)`
//! column buffer like a regular im2col, except that every kernel tap reads the
//! image at its nominal location displaced by a learned offset, using bilinear
//! interpolation. `deformable_col2im` and `deformable_col2im_coord` are its two
//! gradient counterparts, for the image and for the offset field.
//!
//! Offsets are stored as `(deformable_group * kh * kw * 2, out_h, out_w)`. For
//! group `g` and tap `(i, j)` the channel `(g * kh * kw + i * kw + j) * 2` holds
//! the y displacement and the next channel the x displacement.
//!
//! A displaced sample outside `[0, height) x [0, width)` reads as zero and
//! receives no gradient. Inside that range each bilinear corner is handled on
//! its own, so corners past the bottom or right edge contribute zero.

use rayon::prelude::*;

use crate::{
    error::{check_len, KernelResult},
    geometry::{conv_output_size, BilinearCorners, SamplePoint},
};

/// Geometry of one image passing through a deformable convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeformableGeometry {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel: [usize; 2],
    pub pad: [usize; 2],
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    pub deformable_group: usize,
    pub out_h: usize,
    pub out_w: usize,
}

impl DeformableGeometry {
    /// Derives the output extent. Returns `None` if the kernel does not fit,
    /// any size is zero, or the channels do not split evenly into groups.
    pub fn new(
        channels: usize,
        [height, width]: [usize; 2],
        kernel: [usize; 2],
        pad: [usize; 2],
        stride: [usize; 2],
        dilation: [usize; 2],
        deformable_group: usize,
    ) -> Option<Self> {
        if deformable_group == 0 || channels % deformable_group != 0 {
            return None;
        }
        if dilation.contains(&0) {
            return None;
        }
        let out_h = conv_output_size(height, kernel[0], stride[0], pad[0], dilation[0])?;
        let out_w = conv_output_size(width, kernel[1], stride[1], pad[1], dilation[1])?;
        Some(Self {
            channels,
            height,
            width,
            kernel,
            pad,
            stride,
            dilation,
            deformable_group,
            out_h,
            out_w,
        })
    }

    /// Number of kernel taps.
    pub const fn taps(&self) -> usize {
        self.kernel[0] * self.kernel[1]
    }

    pub const fn out_spatial(&self) -> usize {
        self.out_h * self.out_w
    }

    pub const fn image_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Rows of the column buffer, `channels * kh * kw`.
    pub const fn col_rows(&self) -> usize {
        self.channels * self.taps()
    }

    pub const fn col_len(&self) -> usize {
        self.col_rows() * self.out_spatial()
    }

    /// Channels of the offset field, `deformable_group * kh * kw * 2`.
    pub const fn offset_channels(&self) -> usize {
        self.deformable_group * self.taps() * 2
    }

    pub const fn offset_len(&self) -> usize {
        self.offset_channels() * self.out_spatial()
    }

    const fn channels_per_group(&self) -> usize {
        self.channels / self.deformable_group
    }

    /// Displaced sampling location of `tap` for output `(oh, ow)` in group `group`.
    fn sample_point(&self, offset: &[f32], group: usize, tap: usize, oh: usize, ow: usize) -> SamplePoint {
        let spatial = self.out_spatial();
        let position = oh * self.out_w + ow;
        let channel = (group * self.taps() + tap) * 2;
        let dy = offset[channel * spatial + position];
        let dx = offset[(channel + 1) * spatial + position];

        let (i, j) = (tap / self.kernel[1], tap % self.kernel[1]);
        let y = (oh * self.stride[0] + i * self.dilation[0]) as f32 - self.pad[0] as f32;
        let x = (ow * self.stride[1] + j * self.dilation[1]) as f32 - self.pad[1] as f32;
        SamplePoint::new(y + dy, x + dx)
    }

    /// Bilinear corners of a displaced sample, or `None` when it falls outside the image.
    fn corners(&self, point: SamplePoint) -> Option<BilinearCorners> {
        point
            .is_inside(self.height, self.width)
            .then(|| BilinearCorners::new(point, self.height, self.width))
    }

    fn check(&self, image: usize, offset: usize, col: usize) -> KernelResult<()> {
        check_len("image", image, self.image_len())?;
        check_len("offset", offset, self.offset_len())?;
        check_len("columns", col, self.col_len())
    }
}

/// Fills `col` with the offset-displaced, bilinearly sampled patches of `image`.
///
/// Row `c * kh * kw + tap` of `col` holds channel `c` sampled at `tap` for every
/// output location.
pub fn deformable_im2col(
    image: &[f32],
    offset: &[f32],
    geometry: &DeformableGeometry,
    col: &mut [f32],
) -> KernelResult<()> {
    geometry.check(image.len(), offset.len(), col.len())?;
    let g = geometry;
    let plane = g.height * g.width;
    let spatial = g.out_spatial();
    if spatial == 0 {
        return Ok(());
    }

    col.par_chunks_mut(spatial)
        .enumerate()
        .for_each(|(row, col_row)| {
            let (c, tap) = (row / g.taps(), row % g.taps());
            let group = c / g.channels_per_group();
            let channel = &image[c * plane..(c + 1) * plane];
            for oh in 0..g.out_h {
                for ow in 0..g.out_w {
                    let point = g.sample_point(offset, group, tap, oh, ow);
                    col_row[oh * g.out_w + ow] = g
                        .corners(point)
                        .map_or(0.0, |corners| corners.sample(channel));
                }
            }
        });
    Ok(())
}

/// Scatters a column-buffer gradient back onto the image it was sampled from.
///
/// Values are added into `grad_image`; callers zero it first when they want
/// the gradient of a single pass.
pub fn deformable_col2im(
    col: &[f32],
    offset: &[f32],
    geometry: &DeformableGeometry,
    grad_image: &mut [f32],
) -> KernelResult<()> {
    geometry.check(grad_image.len(), offset.len(), col.len())?;
    let g = geometry;
    let plane = g.height * g.width;
    let spatial = g.out_spatial();
    if plane == 0 {
        return Ok(());
    }

    // each channel plane only receives from its own column rows
    grad_image
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(c, grad_channel)| {
            let group = c / g.channels_per_group();
            for tap in 0..g.taps() {
                let col_row = &col[(c * g.taps() + tap) * spatial..][..spatial];
                for oh in 0..g.out_h {
                    for ow in 0..g.out_w {
                        let value = col_row[oh * g.out_w + ow];
                        let point = g.sample_point(offset, group, tap, oh, ow);
                        if let Some(corners) = g.corners(point) {
                            corners.scatter(grad_channel, value);
                        }
                    }
                }
            }
        });
    Ok(())
}

/// Computes the gradient of the offset field from a column-buffer gradient.
///
/// Each offset scalar receives the sum, over the channels of its deformable
/// group, of the column gradient at its tap times the derivative of the
/// bilinear sample along its axis. `grad_offset` is overwritten.
pub fn deformable_col2im_coord(
    col: &[f32],
    image: &[f32],
    offset: &[f32],
    geometry: &DeformableGeometry,
    grad_offset: &mut [f32],
) -> KernelResult<()> {
    geometry.check(image.len(), offset.len(), col.len())?;
    check_len("offset gradient", grad_offset.len(), geometry.offset_len())?;
    let g = geometry;
    let plane = g.height * g.width;
    let spatial = g.out_spatial();
    if spatial == 0 {
        return Ok(());
    }

    grad_offset
        .par_chunks_mut(spatial)
        .enumerate()
        .for_each(|(channel, grad_row)| {
            let group = channel / (2 * g.taps());
            let tap = (channel / 2) % g.taps();
            let along_x = channel % 2 == 1;
            let first = group * g.channels_per_group();

            for oh in 0..g.out_h {
                for ow in 0..g.out_w {
                    let position = oh * g.out_w + ow;
                    let point = g.sample_point(offset, group, tap, oh, ow);
                    grad_row[position] = g.corners(point).map_or(0.0, |corners| {
                        (first..first + g.channels_per_group())
                            .map(|c| {
                                let data = &image[c * plane..(c + 1) * plane];
                                let slope = if along_x {
                                    corners.grad_x(data)
                                } else {
                                    corners.grad_y(data)
                                };
                                col[(c * g.taps() + tap) * spatial + position] * slope
                            })
                            .sum()
                    });
                }
            }
        });
    Ok(())
}
