//! Local-neighbourhood smoothing: median filter followed by a Gaussian blur.
//!
//! Both filters work over every axis of the tensor and use half-sample
//! symmetric ("reflect") boundaries, i.e. `d c b a | a b c d | d c b a`.

use ndarray::{ArrayD, Axis, IxDyn, Zip};

use crate::Tensor;

const MEDIAN_SIZE: usize = 3;
const SIGMA: f32 = 1.0;
const TRUNCATE: f32 = 4.0;

pub(super) fn smooth(a: &Tensor) -> Tensor {
    let x = a.to_f32();
    if x.ndim() == 0 || x.is_empty() {
        return a.clone();
    }
    let filtered = median_filter(&x);
    Tensor::from_f32(gaussian_filter(filtered), a.dtype())
}

/// Map an out-of-range index back into `0..len` by reflection.
fn reflect(i: isize, len: usize) -> usize {
    let n = len as isize;
    if n == 1 {
        return 0;
    }
    let period = 2 * n;
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - 1 - i;
    }
    i as usize
}

fn median_filter(x: &ArrayD<f32>) -> ArrayD<f32> {
    let ndim = x.ndim();
    let radius = (MEDIAN_SIZE / 2) as isize;
    let offsets = neighbourhood(ndim, radius);
    let shape = x.shape().to_vec();

    let mut window = Vec::with_capacity(offsets.len());
    let mut idx = vec![0usize; ndim];
    let mut out = ArrayD::<f32>::zeros(x.raw_dim());
    for (pos, slot) in out.indexed_iter_mut() {
        window.clear();
        for offset in &offsets {
            for d in 0..ndim {
                idx[d] = reflect(pos[d] as isize + offset[d], shape[d]);
            }
            window.push(x[IxDyn(&idx)]);
        }
        let mid = window.len() / 2;
        let (_, median, _) = window.select_nth_unstable_by(mid, f32::total_cmp);
        *slot = *median;
    }
    out
}

/// Every offset in `[-radius, radius]^ndim`.
fn neighbourhood(ndim: usize, radius: isize) -> Vec<Vec<isize>> {
    let mut offsets = vec![Vec::with_capacity(ndim)];
    for _ in 0..ndim {
        offsets = offsets
            .into_iter()
            .flat_map(|prefix| {
                (-radius..=radius).map(move |o| {
                    let mut next = prefix.clone();
                    next.push(o);
                    next
                })
            })
            .collect();
    }
    offsets
}

fn gaussian_kernel() -> Vec<f32> {
    let radius = (TRUNCATE * SIGMA + 0.5) as isize;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|x| (-0.5 * (x as f32 / SIGMA).powi(2)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= sum);
    kernel
}

/// Separable Gaussian: one 1-D correlation per axis.
fn gaussian_filter(mut x: ArrayD<f32>) -> ArrayD<f32> {
    let kernel = gaussian_kernel();
    let radius = (kernel.len() / 2) as isize;
    for axis in 0..x.ndim() {
        let mut out = ArrayD::<f32>::zeros(x.raw_dim());
        Zip::from(out.lanes_mut(Axis(axis)))
            .and(x.lanes(Axis(axis)))
            .for_each(|mut dst, src| {
                let n = src.len();
                for j in 0..n {
                    let mut acc = 0.0f32;
                    for (k, w) in kernel.iter().enumerate() {
                        let i = reflect(j as isize + k as isize - radius, n);
                        acc += w * src[i];
                    }
                    dst[j] = acc;
                }
            });
        x = out;
    }
    x
}
