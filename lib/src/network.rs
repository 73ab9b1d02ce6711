//! A native, frozen, sequential convolutional network.
//!
//! Only the two operations VGG-style feature extractors are made of are
//! supported: "same" padded stride 1 convolutions with a fused ReLU, and 2x2
//! max pooling. Both the forward pass and the reverse pass (gradient with
//! respect to the input, never the weights) are implemented by hand.

use rand::{distributions::Uniform, Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::io::{Read, Write};

use crate::{
    extractor::{FeatureExtractor, FeatureMaps, LayerSet},
    tensor::{Shape, Tensor},
    Error,
};

const NETWORK_MAGIC: u32 = 0x4E53_0001;

const KIND_CONV: u32 = 0;
const KIND_MAX_POOL: u32 = 1;

const MAX_NAME_LEN: u32 = 256;
const MAX_PARAMETERS: usize = 1 << 28;

/// The layer names of the VGG16 convolutional trunk, in order, as named by
/// Keras
pub const VGG16_LAYERS: &[&str] = &[
    "block1_conv1",
    "block1_conv2",
    "block1_pool",
    "block2_conv1",
    "block2_conv2",
    "block2_pool",
    "block3_conv1",
    "block3_conv2",
    "block3_conv3",
    "block3_pool",
    "block4_conv1",
    "block4_conv2",
    "block4_conv3",
    "block4_pool",
    "block5_conv1",
    "block5_conv2",
    "block5_conv3",
];

/// A square convolution with "same" zero padding and stride 1
#[derive(Clone, Debug)]
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    relu: bool,
    /// `[out][in][ky][kx]`
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl Conv2d {
    #[inline]
    fn weight(&self, o: usize, i: usize, ky: usize, kx: usize) -> f32 {
        self.weights[((o * self.in_channels + i) * self.kernel + ky) * self.kernel + kx]
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel(&self) -> usize {
        self.kernel
    }
}

#[derive(Clone, Debug)]
enum LayerKind {
    Conv2d(Conv2d),
    MaxPool2d,
}

#[derive(Clone, Debug)]
struct Layer {
    name: String,
    kind: LayerKind,
}

/// A frozen sequential network of convolution and pooling layers
#[derive(Clone, Debug)]
pub struct Network {
    input_channels: usize,
    layers: Vec<Layer>,
    max_thread_count: usize,
}

impl Network {
    pub fn builder(input_channels: usize) -> NetworkBuilder {
        NetworkBuilder::new(input_channels)
    }

    /// Builds the VGG16 convolutional trunk with Glorot uniform weights
    /// generated from `seed`.
    ///
    /// The weights are not pretrained, so the features are random
    /// projections rather than learned ones. This is mostly useful for
    /// testing and benchmarking; load real weights with `Network::read`.
    pub fn vgg16(seed: u64) -> Self {
        let mut builder = NetworkBuilder::new(3).seed(seed);
        let mut channels = 0;

        for name in VGG16_LAYERS {
            if name.ends_with("_pool") {
                builder = builder.max_pool(*name);
                continue;
            }

            // block1 => 64, block2 => 128, ..., capped at 512
            if name.ends_with("_conv1") {
                let block = name.as_bytes()[5] - b'0';
                channels = (64 << (block - 1)).min(512);
            }

            builder = builder.conv(*name, channels, 3);
        }

        match builder.build() {
            Ok(net) => net,
            // the architecture above is static, so this can only be a bug
            Err(e) => unreachable!("invalid vgg16 architecture: {}", e),
        }
    }

    /// Controls the maximum number of threads used for a single forward or
    /// reverse pass.
    ///
    /// Default: The number of logical cores on this system.
    pub fn with_max_thread_count(mut self, count: usize) -> Self {
        self.max_thread_count = count.max(1);
        self
    }

    pub fn max_thread_count(&self) -> usize {
        self.max_thread_count
    }

    /// Returns the convolution parameters of a layer, if it is one
    pub fn conv(&self, name: &str) -> Option<&Conv2d> {
        self.layers.iter().find(|l| l.name == name).and_then(|l| match &l.kind {
            LayerKind::Conv2d(conv) => Some(conv),
            LayerKind::MaxPool2d => None,
        })
    }

    fn layer_index(&self, name: &str) -> Result<usize, Error> {
        self.layers
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| Error::UnknownLayer(name.to_owned()))
    }

    fn check_input(&self, input: &Tensor) -> Result<(), Error> {
        let shape = input.shape();
        if shape.channels != self.input_channels || shape.plane() == 0 {
            return Err(Error::shape(
                "network input",
                format!("{}xHxW with H,W > 0", self.input_channels),
                shape,
            ));
        }
        Ok(())
    }

    fn forward_layer(&self, layer: &Layer, input: &Tensor) -> Result<Tensor, Error> {
        match &layer.kind {
            LayerKind::Conv2d(conv) => Ok(conv_forward(conv, input, self.max_thread_count)),
            LayerKind::MaxPool2d => max_pool_forward(input),
        }
    }

    /// Computes the gradient with respect to a layer's input, given the
    /// gradient with respect to its output
    fn backward_layer(
        &self,
        layer: &Layer,
        input: &Tensor,
        output: &Tensor,
        grad: &Tensor,
    ) -> Tensor {
        match &layer.kind {
            LayerKind::Conv2d(conv) => {
                conv_backward(conv, input.shape(), output, grad, self.max_thread_count)
            }
            LayerKind::MaxPool2d => max_pool_backward(input, grad),
        }
    }

    /// Writes the network in the binary weights format, returning the number
    /// of bytes written
    pub fn write<W: Write>(&self, w: &mut W) -> std::io::Result<usize> {
        let mut written = 0;

        let mut put_u32 = |w: &mut W, v: u32| -> std::io::Result<()> {
            w.write_all(&v.to_le_bytes())?;
            written += 4;
            Ok(())
        };

        put_u32(w, NETWORK_MAGIC)?;
        put_u32(w, self.input_channels as u32)?;
        put_u32(w, self.layers.len() as u32)?;

        let mut payload = 0;
        for layer in &self.layers {
            match &layer.kind {
                LayerKind::Conv2d(_) => put_u32(w, KIND_CONV)?,
                LayerKind::MaxPool2d => put_u32(w, KIND_MAX_POOL)?,
            }

            put_u32(w, layer.name.len() as u32)?;
            w.write_all(layer.name.as_bytes())?;
            payload += layer.name.len();

            if let LayerKind::Conv2d(conv) = &layer.kind {
                put_u32(w, conv.in_channels as u32)?;
                put_u32(w, conv.out_channels as u32)?;
                put_u32(w, conv.kernel as u32)?;
                put_u32(w, u32::from(conv.relu))?;

                for v in conv.weights.iter().chain(conv.bias.iter()) {
                    w.write_all(&v.to_le_bytes())?;
                }
                payload += 4 * (conv.weights.len() + conv.bias.len());
            }
        }

        Ok(written + payload)
    }

    /// Reads a network previously written with `Network::write`
    pub fn read<R: Read>(r: &mut R) -> Result<Self, Error> {
        let magic = read_u32(r)?;
        if magic >> 16 != NETWORK_MAGIC >> 16 {
            return Err(Error::InvalidNetwork("invalid magic".to_owned()));
        }

        if magic & 0x0000_ffff != NETWORK_MAGIC & 0x0000_ffff {
            return Err(Error::InvalidNetwork(format!(
                "unsupported version {}",
                magic & 0x0000_ffff
            )));
        }

        let input_channels = read_u32(r)? as usize;
        let layer_count = read_u32(r)?;

        let mut builder = NetworkBuilder::new(input_channels);

        for _ in 0..layer_count {
            let kind = read_u32(r)?;

            let name_len = read_u32(r)?;
            if name_len == 0 || name_len > MAX_NAME_LEN {
                return Err(Error::InvalidNetwork(format!(
                    "layer name length {} is invalid",
                    name_len
                )));
            }
            let mut name = vec![0u8; name_len as usize];
            read_exact(r, &mut name)?;
            let name = String::from_utf8(name)
                .map_err(|_utf| Error::InvalidNetwork("layer name is not utf-8".to_owned()))?;

            builder = match kind {
                KIND_CONV => {
                    let in_channels = read_u32(r)? as usize;
                    let out_channels = read_u32(r)? as usize;
                    let kernel = read_u32(r)? as usize;
                    let relu = read_u32(r)? != 0;

                    let count = out_channels
                        .checked_mul(in_channels)
                        .and_then(|n| n.checked_mul(kernel))
                        .and_then(|n| n.checked_mul(kernel))
                        .filter(|n| *n <= MAX_PARAMETERS)
                        .ok_or_else(|| {
                            Error::InvalidNetwork(format!("layer '{}' is too large", name))
                        })?;

                    let weights = read_f32s(r, count)?;
                    let bias = read_f32s(r, out_channels)?;

                    builder.push_conv(name, in_channels, out_channels, kernel, relu, weights, bias)
                }
                KIND_MAX_POOL => builder.max_pool(name),
                other => {
                    return Err(Error::InvalidNetwork(format!(
                        "unknown layer kind {}",
                        other
                    )))
                }
            };
        }

        builder.build()
    }
}

impl FeatureExtractor for Network {
    fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    fn input_channels(&self) -> usize {
        self.input_channels
    }

    fn extract(&self, input: &Tensor, layers: &LayerSet) -> Result<FeatureMaps, Error> {
        self.check_input(input)?;

        let mut deepest = None;
        for name in layers.iter() {
            let index = self.layer_index(name)?;
            deepest = deepest.max(Some(index));
        }

        let mut maps = FeatureMaps::new();
        let deepest = match deepest {
            Some(d) => d,
            None => return Ok(maps),
        };

        let mut current = input.clone();
        for layer in &self.layers[..=deepest] {
            current = self.forward_layer(layer, &current)?;
            if layers.contains(&layer.name) {
                maps.insert(layer.name.clone(), current.clone());
            }
        }

        Ok(maps)
    }

    /// Every max pool up to the deepest requested layer halves the size and
    /// needs at least a 2x2 input
    fn min_input_size(&self, layers: &LayerSet) -> usize {
        let deepest = layers
            .iter()
            .filter_map(|name| self.layer_index(name).ok())
            .max();

        let pools = match deepest {
            Some(deepest) => self.layers[..=deepest]
                .iter()
                .filter(|l| matches!(l.kind, LayerKind::MaxPool2d))
                .count(),
            None => 0,
        };

        1 << pools
    }

    fn backward(&self, input: &Tensor, output_grads: &FeatureMaps) -> Result<Tensor, Error> {
        self.check_input(input)?;

        let mut deepest = None;
        for (name, _) in output_grads.iter() {
            let index = self.layer_index(name)?;
            deepest = deepest.max(Some(index));
        }

        let deepest = match deepest {
            Some(d) => d,
            None => return Ok(Tensor::zeros(input.shape())),
        };

        // activations[0] is the input, activations[i + 1] the output of layer i
        let mut activations = Vec::with_capacity(deepest + 2);
        activations.push(input.clone());
        for layer in &self.layers[..=deepest] {
            let next = self.forward_layer(layer, &activations[activations.len() - 1])?;
            activations.push(next);
        }

        let mut grad = Tensor::zeros(activations[deepest + 1].shape());
        for index in (0..=deepest).rev() {
            let layer = &self.layers[index];

            if let Some(g) = output_grads.get(&layer.name) {
                if g.shape() != grad.shape() {
                    return Err(Error::shape(
                        "layer gradient",
                        grad.shape(),
                        g.shape(),
                    ));
                }
                grad.add_scaled(g, 1.0);
            }

            grad = self.backward_layer(layer, &activations[index], &activations[index + 1], &grad);
        }

        Ok(grad)
    }
}

/// Builds a `Network` layer by layer, checking that the layers chain
/// together when `build` is called
pub struct NetworkBuilder {
    input_channels: usize,
    layers: Vec<Layer>,
    channels: usize,
    rng: Pcg32,
    error: Option<Error>,
}

impl NetworkBuilder {
    pub fn new(input_channels: usize) -> Self {
        Self {
            input_channels,
            layers: Vec::new(),
            channels: input_channels,
            rng: Pcg32::seed_from_u64(0),
            error: None,
        }
    }

    /// Changes the seed used to initialize the weights of layers added with
    /// `conv`
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = Pcg32::seed_from_u64(seed);
        self
    }

    /// Adds a convolution with a fused ReLU, with weights drawn from a
    /// Glorot uniform distribution and zero biases
    pub fn conv<S: Into<String>>(mut self, name: S, out_channels: usize, kernel: usize) -> Self {
        let in_channels = self.channels;
        let fan_in = in_channels * kernel * kernel;
        let fan_out = out_channels * kernel * kernel;
        let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();

        let dist = Uniform::new_inclusive(-limit, limit);
        let weights: Vec<f32> = (&mut self.rng)
            .sample_iter(dist)
            .take(out_channels * fan_in)
            .collect();

        self.push_conv(
            name.into(),
            in_channels,
            out_channels,
            kernel,
            true,
            weights,
            vec![0.0; out_channels],
        )
    }

    /// Adds a convolution with explicit weights, laid out as
    /// `[out][in][ky][kx]`
    pub fn conv_with_weights<S: Into<String>>(
        self,
        name: S,
        out_channels: usize,
        kernel: usize,
        relu: bool,
        weights: Vec<f32>,
        bias: Vec<f32>,
    ) -> Self {
        let in_channels = self.channels;
        self.push_conv(
            name.into(),
            in_channels,
            out_channels,
            kernel,
            relu,
            weights,
            bias,
        )
    }

    /// Adds a 2x2 max pooling layer with stride 2
    pub fn max_pool<S: Into<String>>(mut self, name: S) -> Self {
        self.layers.push(Layer {
            name: name.into(),
            kind: LayerKind::MaxPool2d,
        });
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn push_conv(
        mut self,
        name: String,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        relu: bool,
        weights: Vec<f32>,
        bias: Vec<f32>,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }

        if in_channels != self.channels {
            self.error = Some(Error::InvalidNetwork(format!(
                "layer '{}' takes {} channels, but the previous layer produces {}",
                name, in_channels, self.channels
            )));
        } else if kernel == 0 || kernel % 2 == 0 {
            self.error = Some(Error::InvalidNetwork(format!(
                "layer '{}' has an even or empty kernel size {}",
                name, kernel
            )));
        } else if out_channels == 0
            || weights.len() != out_channels * in_channels * kernel * kernel
            || bias.len() != out_channels
        {
            self.error = Some(Error::InvalidNetwork(format!(
                "layer '{}' has {} weights and {} biases, which doesn't match {}x{}x{}x{}",
                name,
                weights.len(),
                bias.len(),
                out_channels,
                in_channels,
                kernel,
                kernel
            )));
        }

        self.channels = out_channels;
        self.layers.push(Layer {
            name,
            kind: LayerKind::Conv2d(Conv2d {
                in_channels,
                out_channels,
                kernel,
                relu,
                weights,
                bias,
            }),
        });
        self
    }

    pub fn build(self) -> Result<Network, Error> {
        if let Some(err) = self.error {
            return Err(err);
        }

        if self.input_channels == 0 {
            return Err(Error::InvalidNetwork(
                "the network must take at least 1 input channel".to_owned(),
            ));
        }

        if self.layers.is_empty() {
            return Err(Error::InvalidNetwork(
                "the network has no layers".to_owned(),
            ));
        }

        for (i, layer) in self.layers.iter().enumerate() {
            if self.layers[..i].iter().any(|l| l.name == layer.name) {
                return Err(Error::InvalidNetwork(format!(
                    "layer name '{}' is used more than once",
                    layer.name
                )));
            }
        }

        Ok(Network {
            input_channels: self.input_channels,
            layers: self.layers,
            max_thread_count: num_cpus::get(),
        })
    }
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::InvalidNetwork("the weights file is truncated".to_owned())
        } else {
            Error::Io(e)
        }
    })
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Reads `count` little endian floats. The buffer only grows as data
/// arrives, so a header claiming more than the file holds fails cheaply.
fn read_f32s<R: Read>(r: &mut R, count: usize) -> Result<Vec<f32>, Error> {
    let len = count * 4;
    let mut bytes = Vec::new();
    r.by_ref()
        .take(len as u64)
        .read_to_end(&mut bytes)
        .map_err(Error::Io)?;
    if bytes.len() != len {
        return Err(Error::InvalidNetwork(
            "the weights file is truncated".to_owned(),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Runs `work` on each channel plane of `out`, spreading the channels over
/// at most `max_threads` scoped threads. Every plane is written by exactly
/// one call, so the result doesn't depend on the thread count.
fn for_each_channel<F>(out: &mut [f32], plane: usize, max_threads: usize, work: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    if plane == 0 {
        return;
    }

    let channels = out.len() / plane;
    let workers = max_threads.max(1).min(channels.max(1));

    // for WASM we do not have threads and crossbeam panics
    #[cfg(target_arch = "wasm32")]
    let workers = 1;

    if workers <= 1 {
        for (c, chunk) in out.chunks_mut(plane).enumerate() {
            work(c, chunk);
        }
        return;
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        let per_worker = (channels + workers - 1) / workers;
        let work = &work;

        let scoped = crossbeam_utils::thread::scope(|scope| {
            for (w, span) in out.chunks_mut(per_worker * plane).enumerate() {
                scope.spawn(move |_| {
                    for (c, chunk) in span.chunks_mut(plane).enumerate() {
                        work(w * per_worker + c, chunk);
                    }
                });
            }
        });

        if let Err(panic) = scoped {
            std::panic::resume_unwind(panic);
        }
    }
}

/// The destination and source spans of a row shifted by `d`, clamped to
/// `[0, len)`. Returns `None` if nothing overlaps.
#[inline]
fn shifted_span(len: usize, d: isize) -> Option<(usize, usize)> {
    let lo = (-d).max(0);
    let hi = (len as isize - d).min(len as isize);
    if lo >= hi {
        None
    } else {
        Some((lo as usize, hi as usize))
    }
}

fn conv_forward(conv: &Conv2d, input: &Tensor, max_threads: usize) -> Tensor {
    let shape = input.shape();
    let (h, w) = (shape.height, shape.width);
    let pad = (conv.kernel / 2) as isize;

    let mut output = Tensor::zeros(Shape::new(conv.out_channels, h, w));

    for_each_channel(output.as_mut_slice(), shape.plane(), max_threads, |o, out| {
        for v in out.iter_mut() {
            *v = conv.bias[o];
        }

        for i in 0..conv.in_channels {
            let src = input.channel(i);

            for ky in 0..conv.kernel {
                let dy = ky as isize - pad;
                let (y0, y1) = match shifted_span(h, dy) {
                    Some(span) => span,
                    None => continue,
                };

                for kx in 0..conv.kernel {
                    let dx = kx as isize - pad;
                    let (x0, x1) = match shifted_span(w, dx) {
                        Some(span) => span,
                        None => continue,
                    };

                    let weight = conv.weight(o, i, ky, kx);
                    let sx0 = (x0 as isize + dx) as usize;

                    for y in y0..y1 {
                        let sy = (y as isize + dy) as usize;
                        let dst = &mut out[y * w + x0..y * w + x1];
                        let row = &src[sy * w + sx0..sy * w + sx0 + (x1 - x0)];
                        for (d, s) in dst.iter_mut().zip(row.iter()) {
                            *d += weight * s;
                        }
                    }
                }
            }
        }

        if conv.relu {
            for v in out.iter_mut() {
                *v = v.max(0.0);
            }
        }
    });

    output
}

fn conv_backward(
    conv: &Conv2d,
    input_shape: Shape,
    output: &Tensor,
    grad_output: &Tensor,
    max_threads: usize,
) -> Tensor {
    let (h, w) = (input_shape.height, input_shape.width);
    let pad = (conv.kernel / 2) as isize;

    // the relu passes gradient only where it was active
    let mut masked = grad_output.clone();
    if conv.relu {
        for (g, o) in masked.as_mut_slice().iter_mut().zip(output.as_slice()) {
            if *o <= 0.0 {
                *g = 0.0;
            }
        }
    }
    let masked = &masked;

    let mut grad_input = Tensor::zeros(input_shape);

    for_each_channel(grad_input.as_mut_slice(), input_shape.plane(), max_threads, |i, gin| {
        for o in 0..conv.out_channels {
            let g = masked.channel(o);

            for ky in 0..conv.kernel {
                let dy = ky as isize - pad;
                let (y0, y1) = match shifted_span(h, dy) {
                    Some(span) => span,
                    None => continue,
                };

                for kx in 0..conv.kernel {
                    let dx = kx as isize - pad;
                    let (x0, x1) = match shifted_span(w, dx) {
                        Some(span) => span,
                        None => continue,
                    };

                    let weight = conv.weight(o, i, ky, kx);
                    let sx0 = (x0 as isize + dx) as usize;

                    // out[y][x] read in[y + dy][x + dx], so the gradient
                    // flows back along the same offsets
                    for y in y0..y1 {
                        let sy = (y as isize + dy) as usize;
                        let row = &g[y * w + x0..y * w + x1];
                        let dst = &mut gin[sy * w + sx0..sy * w + sx0 + (x1 - x0)];
                        for (d, s) in dst.iter_mut().zip(row.iter()) {
                            *d += weight * s;
                        }
                    }
                }
            }
        }
    });

    grad_input
}

fn max_pool_forward(input: &Tensor) -> Result<Tensor, Error> {
    let shape = input.shape();
    if shape.height < 2 || shape.width < 2 {
        return Err(Error::shape(
            "max pool input",
            "at least 2x2 spatially",
            shape,
        ));
    }

    let (oh, ow) = (shape.height / 2, shape.width / 2);
    let mut output = Tensor::zeros(Shape::new(shape.channels, oh, ow));

    for c in 0..shape.channels {
        let src = input.channel(c);
        let dst = output.channel_mut(c);
        for y in 0..oh {
            for x in 0..ow {
                let top = 2 * y * shape.width + 2 * x;
                let bottom = top + shape.width;
                dst[y * ow + x] = src[top]
                    .max(src[top + 1])
                    .max(src[bottom])
                    .max(src[bottom + 1]);
            }
        }
    }

    Ok(output)
}

fn max_pool_backward(input: &Tensor, grad_output: &Tensor) -> Tensor {
    let shape = input.shape();
    let out_shape = grad_output.shape();
    let mut grad_input = Tensor::zeros(shape);

    for c in 0..shape.channels {
        let src = input.channel(c);
        let g = grad_output.channel(c);
        let dst = grad_input.channel_mut(c);

        for y in 0..out_shape.height {
            for x in 0..out_shape.width {
                let top = 2 * y * shape.width + 2 * x;
                let bottom = top + shape.width;

                // ties go to the first candidate in scan order
                let mut best = top;
                for &candidate in &[top + 1, bottom, bottom + 1] {
                    if src[candidate] > src[best] {
                        best = candidate;
                    }
                }

                dst[best] += g[y * out_shape.width + x];
            }
        }
    }

    grad_input
}
