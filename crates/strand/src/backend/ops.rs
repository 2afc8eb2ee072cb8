// Numeric ops of the provider contract: expit, erf, logsumexp, conv, pooling
//
// LAYOUTS:
//
//   conv      input NHWC [N, H, W, C_in], filter HWIO [kH, kW, C_in, C_out],
//             output NHWC [N, H_out, W_out, C_out]
//   *_pool    input NHWC, window over (H, W), channels untouched
//
// PADDING:
//
//   Valid  windows never leave the input: out = (size - k_eff) / stride + 1
//   Same   out = ceil(size / stride); the missing total is split with the
//          smaller half in front, as XLA does
//
// where k_eff = (k - 1) * dilation + 1.
//
// Everything is built from tensor ops (pad by concatenation, strided window
// views gathered with index_select, one matmul per filter tap), so under
// Autograd the results carry gradients back to input and filter.

use strand_core::backend::Backend;
use strand_core::{DType, Error, Result, Tensor};

use super::{current_provider, Provider};

/// How windows treat the input's borders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

/// Placement of windows along one spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    pad_lo: usize,
    pad_hi: usize,
    out: usize,
}

fn span(size: usize, window: usize, stride: usize, dilation: usize, padding: Padding) -> Result<Span> {
    if window == 0 || stride == 0 || dilation == 0 {
        return Err(Error::msg(format!(
            "window {} / stride {} / dilation {} must all be positive",
            window, stride, dilation
        )));
    }
    let k_eff = (window - 1) * dilation + 1;
    match padding {
        Padding::Valid => {
            if size < k_eff {
                return Err(Error::msg(format!(
                    "VALID window of extent {} does not fit in size {}",
                    k_eff, size
                )));
            }
            Ok(Span {
                pad_lo: 0,
                pad_hi: 0,
                out: (size - k_eff) / stride + 1,
            })
        }
        Padding::Same => {
            let out = size.div_ceil(stride);
            let total = ((out - 1) * stride + k_eff).saturating_sub(size);
            Ok(Span {
                pad_lo: total / 2,
                pad_hi: total - total / 2,
                out,
            })
        }
    }
}

fn check_rank<B: Backend>(what: &str, x: &Tensor<B>, rank: usize) -> Result<()> {
    if x.rank() != rank {
        return Err(Error::msg(format!(
            "{}: expected a rank-{} tensor, got shape {}",
            what,
            rank,
            x.shape()
        )));
    }
    Ok(())
}

/// Pad `dim` with `lo` / `hi` copies of `value`.
fn pad_dim<B: Backend>(x: &Tensor<B>, dim: usize, lo: usize, hi: usize, value: f64) -> Result<Tensor<B>> {
    if lo == 0 && hi == 0 {
        return Ok(x.clone());
    }
    let mut parts = Vec::with_capacity(3);
    if lo > 0 {
        parts.push(Tensor::full(x.shape().with_dim(dim, lo), value, x.dtype(), x.device())?);
    }
    parts.push(x.clone());
    if hi > 0 {
        parts.push(Tensor::full(x.shape().with_dim(dim, hi), value, x.dtype(), x.device())?);
    }
    Tensor::cat(&parts, dim)
}

/// Elements `start, start + stride, ...` (`count` of them) along `dim`.
fn strided<B: Backend>(x: &Tensor<B>, dim: usize, start: usize, count: usize, stride: usize) -> Result<Tensor<B>> {
    let view = x.narrow(dim, start, (count - 1) * stride + 1)?;
    if stride == 1 {
        return Ok(view);
    }
    let idx: Vec<f64> = (0..count).map(|i| (i * stride) as f64).collect();
    let idx = Tensor::from_f64_slice(&idx, count, DType::I64, x.device())?;
    view.index_select(dim, &idx)
}

/// Padded input plus one `[N, H_out, W_out, C]` view per window tap, in
/// row-major tap order.
struct Windows<B: Backend> {
    taps: Vec<Tensor<B>>,
    spans: [Span; 2],
}

fn windows<B: Backend>(
    x: &Tensor<B>,
    window: [usize; 2],
    strides: [usize; 2],
    dilation: [usize; 2],
    padding: Padding,
    fill: f64,
) -> Result<Windows<B>> {
    let spans = [
        span(x.dim(1)?, window[0], strides[0], dilation[0], padding)?,
        span(x.dim(2)?, window[1], strides[1], dilation[1], padding)?,
    ];
    let padded = pad_dim(x, 1, spans[0].pad_lo, spans[0].pad_hi, fill)?;
    let padded = pad_dim(&padded, 2, spans[1].pad_lo, spans[1].pad_hi, fill)?;
    let mut taps = Vec::with_capacity(window[0] * window[1]);
    for i in 0..window[0] {
        let rows = strided(&padded, 1, i * dilation[0], spans[0].out, strides[0])?;
        for j in 0..window[1] {
            taps.push(strided(&rows, 2, j * dilation[1], spans[1].out, strides[1])?);
        }
    }
    Ok(Windows { taps, spans })
}

impl Provider {
    /// Detach results the provider cannot differentiate.
    pub(super) fn finish<B: Backend>(&self, t: Tensor<B>) -> Tensor<B> {
        match self {
            Provider::Autograd => t,
            Provider::Plain => t.detach(),
        }
    }

    /// The logistic sigmoid.
    pub fn expit<B: Backend>(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        match self {
            Provider::Autograd => x.sigmoid(),
            Provider::Plain => {
                let x = x.detach();
                let denom = x.neg()?.exp()?.add_scalar(1.0)?;
                Tensor::ones_like(&x)?.div(&denom)
            }
        }
    }

    /// The Gauss error function, elementwise.
    ///
    /// Abramowitz & Stegun 7.1.26 on `|x|`, mirrored for negative inputs.
    /// Absolute error stays below 1.5e-7.
    pub fn erf<B: Backend>(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        const P: f64 = 0.327_591_1;
        const A: [f64; 5] = [0.254_829_592, -0.284_496_736, 1.421_413_741, -1.453_152_027, 1.061_405_429];

        let negative = x.lt(&Tensor::zeros_like(x)?)?;
        let abs = Tensor::where_cond(&negative, &x.neg()?, x)?;
        let t = Tensor::ones_like(&abs)?.div(&abs.affine(P, 1.0)?)?;
        // Horner: t * (a1 + t * (a2 + ... + t * a5))
        let mut poly = t.mul_scalar(A[4])?;
        for a in A[..4].iter().rev() {
            poly = poly.add_scalar(*a)?.mul(&t)?;
        }
        let gauss = abs.square()?.neg()?.exp()?;
        let y = poly.mul(&gauss)?.affine(-1.0, 1.0)?;
        Ok(self.finish(Tensor::where_cond(&negative, &y.neg()?, &y)?))
    }

    /// `log(sum(exp(x)))` along `axis`, computed stably.
    pub fn logsumexp<B: Backend>(&self, x: &Tensor<B>, axis: i64, keep_dims: bool) -> Result<Tensor<B>> {
        let dim = x.shape().normalize_axis(axis)?;
        Ok(self.finish(x.logsumexp(dim, keep_dims)?))
    }

    /// 2-D convolution, NHWC input and HWIO filter.
    pub fn conv<B: Backend>(
        &self,
        x: &Tensor<B>,
        filter: &Tensor<B>,
        strides: [usize; 2],
        padding: Padding,
        dilation: Option<[usize; 2]>,
    ) -> Result<Tensor<B>> {
        check_rank("conv input", x, 4)?;
        check_rank("conv filter", filter, 4)?;
        let (kh, kw, c_in, c_out) = (filter.dim(0)?, filter.dim(1)?, filter.dim(2)?, filter.dim(3)?);
        if x.dim(3)? != c_in {
            return Err(Error::msg(format!(
                "conv: input has {} channels but the filter expects {}",
                x.dim(3)?,
                c_in
            )));
        }
        let n = x.dim(0)?;
        let win = windows(x, [kh, kw], strides, dilation.unwrap_or([1, 1]), padding, 0.0)?;
        let (ho, wo) = (win.spans[0].out, win.spans[1].out);

        let mut acc: Option<Tensor<B>> = None;
        for (t, tap) in win.taps.iter().enumerate() {
            let w = filter.narrow(0, t / kw, 1)?.narrow(1, t % kw, 1)?.reshape((c_in, c_out))?;
            let y = tap.reshape((n * ho * wo, c_in))?.matmul(&w)?;
            acc = Some(match acc {
                Some(a) => a.add(&y)?,
                None => y,
            });
        }
        let out = acc
            .ok_or_else(|| Error::msg("conv: empty filter"))?
            .reshape((n, ho, wo, c_out))?;
        Ok(self.finish(out))
    }

    fn window_sum<B: Backend>(
        &self,
        x: &Tensor<B>,
        pool_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
    ) -> Result<Tensor<B>> {
        let win = windows(x, pool_size, strides, [1, 1], padding, 0.0)?;
        let mut taps = win.taps.into_iter();
        let first = taps.next().ok_or_else(|| Error::msg("pool: empty window"))?;
        taps.try_fold(first, |acc, tap| acc.add(&tap))
    }

    /// Sum over each window; padding contributes zeros.
    pub fn sum_pool<B: Backend>(
        &self,
        x: &Tensor<B>,
        pool_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
    ) -> Result<Tensor<B>> {
        check_rank("sum_pool input", x, 4)?;
        Ok(self.finish(self.window_sum(x, pool_size, strides, padding)?))
    }

    /// Max over each window; padding never wins.
    pub fn max_pool<B: Backend>(
        &self,
        x: &Tensor<B>,
        pool_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
    ) -> Result<Tensor<B>> {
        check_rank("max_pool input", x, 4)?;
        let win = windows(x, pool_size, strides, [1, 1], padding, f64::NEG_INFINITY)?;
        let out = Tensor::stack(&win.taps, 0)?.max(0, false)?;
        Ok(self.finish(out))
    }

    /// Mean over each window. Under `Same` padding, border windows divide by
    /// the number of real elements they cover.
    pub fn avg_pool<B: Backend>(
        &self,
        x: &Tensor<B>,
        pool_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
    ) -> Result<Tensor<B>> {
        check_rank("avg_pool input", x, 4)?;
        let sums = self.window_sum(x, pool_size, strides, padding)?;
        let out = match padding {
            Padding::Valid => sums.mul_scalar(1.0 / (pool_size[0] * pool_size[1]) as f64)?,
            Padding::Same => {
                let ones = Tensor::ones((1, x.dim(1)?, x.dim(2)?, 1), x.dtype(), x.device())?;
                let counts = self.window_sum(&ones, pool_size, strides, padding)?;
                sums.div(&counts)?
            }
        };
        Ok(self.finish(out))
    }
}

/// [`Provider::expit`] on the current provider.
pub fn expit<B: Backend>(x: &Tensor<B>) -> Result<Tensor<B>> {
    current_provider().expit(x)
}

/// [`Provider::erf`] on the current provider.
pub fn erf<B: Backend>(x: &Tensor<B>) -> Result<Tensor<B>> {
    current_provider().erf(x)
}

/// [`Provider::logsumexp`] on the current provider.
pub fn logsumexp<B: Backend>(x: &Tensor<B>, axis: i64, keep_dims: bool) -> Result<Tensor<B>> {
    current_provider().logsumexp(x, axis, keep_dims)
}

/// [`Provider::conv`] on the current provider.
pub fn conv<B: Backend>(
    x: &Tensor<B>,
    filter: &Tensor<B>,
    strides: [usize; 2],
    padding: Padding,
    dilation: Option<[usize; 2]>,
) -> Result<Tensor<B>> {
    current_provider().conv(x, filter, strides, padding, dilation)
}

/// [`Provider::avg_pool`] on the current provider.
pub fn avg_pool<B: Backend>(
    x: &Tensor<B>,
    pool_size: [usize; 2],
    strides: [usize; 2],
    padding: Padding,
) -> Result<Tensor<B>> {
    current_provider().avg_pool(x, pool_size, strides, padding)
}

/// [`Provider::max_pool`] on the current provider.
pub fn max_pool<B: Backend>(
    x: &Tensor<B>,
    pool_size: [usize; 2],
    strides: [usize; 2],
    padding: Padding,
) -> Result<Tensor<B>> {
    current_provider().max_pool(x, pool_size, strides, padding)
}

/// [`Provider::sum_pool`] on the current provider.
pub fn sum_pool<B: Backend>(
    x: &Tensor<B>,
    pool_size: [usize; 2],
    strides: [usize; 2],
    padding: Padding,
) -> Result<Tensor<B>> {
    current_provider().sum_pool(x, pool_size, strides, padding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_cpu::{CpuDevice, CpuTensor};

    fn image(h: usize, w: usize) -> Result<CpuTensor> {
        let data: Vec<f64> = (0..h * w).map(|i| i as f64).collect();
        CpuTensor::from_f64_slice(&data, (1, h, w, 1), DType::F64, &CpuDevice)
    }

    #[test]
    fn test_span() -> Result<()> {
        assert_eq!(span(5, 3, 1, 1, Padding::Valid)?.out, 3);
        assert_eq!(span(5, 3, 2, 1, Padding::Valid)?.out, 2);
        assert_eq!(span(7, 3, 1, 2, Padding::Valid)?.out, 3);
        let same = span(5, 2, 2, 1, Padding::Same)?;
        assert_eq!((same.out, same.pad_lo, same.pad_hi), (3, 0, 1));
        let same = span(4, 3, 1, 1, Padding::Same)?;
        assert_eq!((same.out, same.pad_lo, same.pad_hi), (4, 1, 1));
        assert!(span(2, 3, 1, 1, Padding::Valid).is_err());
        Ok(())
    }

    #[test]
    fn test_conv_identity_filter() -> Result<()> {
        let x = image(3, 3)?;
        let filter = CpuTensor::ones((1, 1, 1, 1), DType::F64, &CpuDevice)?;
        let y = Provider::Autograd.conv(&x, &filter, [1, 1], Padding::Valid, None)?;
        assert_eq!(y.to_f64_vec()?, x.to_f64_vec()?);
        Ok(())
    }

    #[test]
    fn test_conv_box_filter() -> Result<()> {
        // 2x2 box sums over a 3x3 ramp.
        let x = image(3, 3)?;
        let filter = CpuTensor::ones((2, 2, 1, 1), DType::F64, &CpuDevice)?;
        let y = Provider::Plain.conv(&x, &filter, [1, 1], Padding::Valid, None)?;
        assert_eq!(y.dims(), &[1, 2, 2, 1]);
        assert_eq!(y.to_f64_vec()?, vec![8.0, 12.0, 20.0, 24.0]);

        let y = Provider::Plain.conv(&x, &filter, [1, 1], Padding::Same, None)?;
        assert_eq!(y.dims(), &[1, 3, 3, 1]);
        assert_eq!(y.to_f64_vec()?[8], 8.0);

        // Dilation 2 reaches the corners.
        let y = Provider::Plain.conv(&x, &filter, [1, 1], Padding::Valid, Some([2, 2]))?;
        assert_eq!(y.to_f64_vec()?, vec![0.0 + 2.0 + 6.0 + 8.0]);
        Ok(())
    }

    #[test]
    fn test_pools() -> Result<()> {
        let x = image(4, 4)?;
        let p = Provider::Autograd;
        assert_eq!(p.max_pool(&x, [2, 2], [2, 2], Padding::Valid)?.to_f64_vec()?, vec![5.0, 7.0, 13.0, 15.0]);
        assert_eq!(p.sum_pool(&x, [2, 2], [2, 2], Padding::Valid)?.to_f64_vec()?, vec![10.0, 18.0, 42.0, 50.0]);
        assert_eq!(p.avg_pool(&x, [2, 2], [2, 2], Padding::Valid)?.to_f64_vec()?, vec![2.5, 4.5, 10.5, 12.5]);
        Ok(())
    }

    #[test]
    fn test_avg_pool_same_counts_real_elements() -> Result<()> {
        let x = CpuTensor::ones((1, 3, 3, 2), DType::F64, &CpuDevice)?;
        let y = Provider::Autograd.avg_pool(&x, [2, 2], [1, 1], Padding::Same)?;
        assert_eq!(y.dims(), &[1, 3, 3, 2]);
        assert!(y.to_f64_vec()?.iter().all(|v| (v - 1.0).abs() < 1e-12));
        Ok(())
    }

    #[test]
    fn test_expit_agrees_across_providers() -> Result<()> {
        let x = CpuTensor::from_f64_slice(&[-3.0, 0.0, 2.5], 3, DType::F64, &CpuDevice)?;
        let a = Provider::Autograd.expit(&x)?.to_f64_vec()?;
        let b = Provider::Plain.expit(&x)?.to_f64_vec()?;
        for (u, v) in a.iter().zip(&b) {
            assert!((u - v).abs() < 1e-12);
        }
        assert!((a[1] - 0.5).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_logsumexp() -> Result<()> {
        let x = CpuTensor::from_f64_slice(&[0.0, 0.0, 1000.0, 1000.0], (2, 2), DType::F64, &CpuDevice)?;
        let y = Provider::Plain.logsumexp(&x, -1, false)?.to_f64_vec()?;
        let ln2 = 2f64.ln();
        assert!((y[0] - ln2).abs() < 1e-9);
        assert!((y[1] - (1000.0 + ln2)).abs() < 1e-9);
        Ok(())
    }
}
