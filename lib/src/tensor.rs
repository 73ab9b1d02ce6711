use std::fmt;

/// The dimensions of a channel-major tensor
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Shape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// The number of spatial positions in a single channel
    #[inline]
    pub fn plane(&self) -> usize {
        self.height * self.width
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.channels * self.plane()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

/// A dense `f32` tensor stored channel by channel (CHW)
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(shape: Shape) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.len()],
        }
    }

    /// Wraps an existing buffer, which must hold exactly `shape.len()` values
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Option<Self> {
        if data.len() != shape.len() {
            return None;
        }

        Some(Self { shape, data })
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    pub fn channel(&self, c: usize) -> &[f32] {
        let plane = self.shape.plane();
        &self.data[c * plane..(c + 1) * plane]
    }

    #[inline]
    pub fn channel_mut(&mut self, c: usize) -> &mut [f32] {
        let plane = self.shape.plane();
        &mut self.data[c * plane..(c + 1) * plane]
    }

    #[inline]
    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.shape.height + y) * self.shape.width + x]
    }

    /// Adds `other * scale` into this tensor element-wise
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) {
        debug_assert_eq!(self.shape, other.shape);
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b * scale;
        }
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Per-channel mean value
    pub fn channel_means(&self) -> Vec<f32> {
        let plane = self.shape.plane().max(1) as f64;
        (0..self.shape.channels)
            .map(|c| (self.channel(c).iter().map(|v| f64::from(*v)).sum::<f64>() / plane) as f32)
            .collect()
    }
}

/// A square matrix of inner products between the channels of an activation
#[derive(Clone, Debug, PartialEq)]
pub struct Gram {
    size: usize,
    data: Vec<f32>,
}

impl Gram {
    /// `G = F·Fᵀ / (H·W)`, where `F` is the activation flattened to
    /// `C x (H·W)`
    pub fn from_features(features: &Tensor) -> Self {
        let shape = features.shape();
        let size = shape.channels;
        let norm = shape.plane().max(1) as f64;
        let mut data = vec![0.0; size * size];

        for i in 0..size {
            let fi = features.channel(i);
            for j in i..size {
                let fj = features.channel(j);
                // accumulate in f64, these dot products get long on big layers
                let dot: f64 = fi
                    .iter()
                    .zip(fj.iter())
                    .map(|(a, b)| f64::from(*a) * f64::from(*b))
                    .sum();
                let v = (dot / norm) as f32;
                data[i * size + j] = v;
                data[j * size + i] = v;
            }
        }

        Self { size, data }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.data[i * self.size + j]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}
