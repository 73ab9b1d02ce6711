//! Content and style losses, and their closed form gradients with respect
//! to layer activations.
//!
//! Conventions used throughout:
//!
//! * The content loss of a layer is the mean squared difference between the
//!   generated and the target activations. The total content loss is the
//!   **sum** over all content layers.
//! * The style loss of a layer is the mean squared difference between the
//!   generated and the target Gram matrices. Each layer is scaled by
//!   `1 / number_of_style_layers`, so the total is the average over layers.
//! * `total = content_weight * content + style_weight * style`

use crate::{
    extractor::{FeatureExtractor, FeatureMaps, LayerSet},
    tensor::{Gram, Tensor},
    Error,
};

/// The content and style loss weights
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossWeights {
    pub content: f32,
    pub style: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            content: 1e3,
            style: 1e-2,
        }
    }
}

/// The components of a loss evaluation. `content` and `style` are
/// unweighted, `total` is the weighted sum.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossBreakdown {
    pub total: f32,
    pub content: f32,
    pub style: f32,
}

impl LossBreakdown {
    pub fn is_finite(&self) -> bool {
        self.total.is_finite() && self.content.is_finite() && self.style.is_finite()
    }
}

/// Mean squared difference between two activations
pub fn content_loss(generated: &Tensor, target: &Tensor) -> f32 {
    mean_squared_difference(generated.as_slice(), target.as_slice())
}

/// Mean squared difference between two Gram matrices
pub fn style_loss(generated: &Gram, target: &Gram) -> f32 {
    mean_squared_difference(generated.as_slice(), target.as_slice())
}

fn mean_squared_difference(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 0.0;
    }

    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum();

    (sum / a.len() as f64) as f32
}

/// The fixed targets of a run, computed once from the content and style
/// images
pub struct Targets {
    content_layers: LayerSet,
    style_layers: LayerSet,
    content: FeatureMaps,
    style: Vec<(String, Gram)>,
}

impl Targets {
    pub fn compute(
        extractor: &dyn FeatureExtractor,
        content: &Tensor,
        style: &Tensor,
        content_layers: &LayerSet,
        style_layers: &LayerSet,
    ) -> Result<Self, Error> {
        let content_maps = extractor.extract(content, content_layers)?;
        let style_maps = extractor.extract(style, style_layers)?;

        let mut grams = Vec::with_capacity(style_layers.len());
        for name in style_layers.iter() {
            let features = style_maps
                .get(name)
                .ok_or_else(|| Error::UnknownLayer(name.to_owned()))?;
            grams.push((name.to_owned(), Gram::from_features(features)));
        }

        for name in content_layers.iter() {
            if content_maps.get(name).is_none() {
                return Err(Error::UnknownLayer(name.to_owned()));
            }
        }

        Ok(Self {
            content_layers: content_layers.clone(),
            style_layers: style_layers.clone(),
            content: content_maps,
            style: grams,
        })
    }

    pub fn content_layers(&self) -> &LayerSet {
        &self.content_layers
    }

    pub fn style_layers(&self) -> &LayerSet {
        &self.style_layers
    }

    pub fn content_features(&self, layer: &str) -> Option<&Tensor> {
        self.content.get(layer)
    }

    pub fn style_gram(&self, layer: &str) -> Option<&Gram> {
        self.style.iter().find(|(n, _)| n == layer).map(|(_, g)| g)
    }
}

/// The loss and its gradient with respect to the generated image tensor
pub struct Evaluation {
    pub loss: LossBreakdown,
    pub gradient: Tensor,
}

/// Evaluates the combined loss of a generated image tensor against a set of
/// fixed targets
pub struct LossEngine<'a> {
    extractor: &'a dyn FeatureExtractor,
    targets: &'a Targets,
    weights: LossWeights,
    layers: LayerSet,
}

impl<'a> LossEngine<'a> {
    pub fn new(
        extractor: &'a dyn FeatureExtractor,
        targets: &'a Targets,
        weights: LossWeights,
    ) -> Self {
        let mut layers = targets.content_layers.clone();
        for name in targets.style_layers.iter() {
            layers.insert(name);
        }

        Self {
            extractor,
            targets,
            weights,
            layers,
        }
    }

    pub fn weights(&self) -> LossWeights {
        self.weights
    }

    /// Computes the loss without the gradient
    pub fn loss(&self, generated: &Tensor) -> Result<LossBreakdown, Error> {
        let features = self.extractor.extract(generated, &self.layers)?;
        self.accumulate(&features, None)
    }

    /// Computes the loss and its gradient with respect to `generated`
    pub fn evaluate(&self, generated: &Tensor) -> Result<Evaluation, Error> {
        let features = self.extractor.extract(generated, &self.layers)?;

        let mut layer_grads = FeatureMaps::new();
        let loss = self.accumulate(&features, Some(&mut layer_grads))?;
        let gradient = self.extractor.backward(generated, &layer_grads)?;

        if gradient.shape() != generated.shape() {
            return Err(Error::shape(
                "input gradient",
                generated.shape(),
                gradient.shape(),
            ));
        }

        Ok(Evaluation { loss, gradient })
    }

    fn accumulate(
        &self,
        features: &FeatureMaps,
        mut grads: Option<&mut FeatureMaps>,
    ) -> Result<LossBreakdown, Error> {
        let mut content = 0.0f64;
        for name in self.targets.content_layers.iter() {
            let (generated, target) = self.layer_pair(features, name)?;
            if generated.shape() != target.shape() {
                return Err(Error::shape(
                    "content activation",
                    target.shape(),
                    generated.shape(),
                ));
            }

            content += f64::from(content_loss(generated, target));

            if let Some(grads) = grads.as_mut() {
                // d/dF mean((F - P)^2) = 2 (F - P) / len
                let scale = 2.0 * self.weights.content / generated.shape().len() as f32;
                let mut g = generated.clone();
                for (v, p) in g.as_mut_slice().iter_mut().zip(target.as_slice()) {
                    *v = (*v - p) * scale;
                }
                add_layer_grad(grads, name, g);
            }
        }

        let style_layer_weight = 1.0 / self.targets.style.len().max(1) as f32;
        let mut style = 0.0f64;
        for (name, target) in &self.targets.style {
            let generated = features
                .get(name)
                .ok_or_else(|| Error::UnknownLayer(name.clone()))?;
            let gram = Gram::from_features(generated);
            if gram.size() != target.size() {
                return Err(Error::shape(
                    "style activation channels",
                    target.size(),
                    gram.size(),
                ));
            }

            style += f64::from(style_layer_weight * style_loss(&gram, target));

            if let Some(grads) = grads.as_mut() {
                let scale = self.weights.style * style_layer_weight;
                add_layer_grad(grads, name, style_gradient(generated, &gram, target, scale));
            }
        }

        let content = content as f32;
        let style = style as f32;

        Ok(LossBreakdown {
            total: self.weights.content * content + self.weights.style * style,
            content,
            style,
        })
    }

    fn layer_pair<'f>(
        &'f self,
        features: &'f FeatureMaps,
        name: &str,
    ) -> Result<(&'f Tensor, &'f Tensor), Error> {
        let generated = features
            .get(name)
            .ok_or_else(|| Error::UnknownLayer(name.to_owned()))?;
        let target = self
            .targets
            .content
            .get(name)
            .ok_or_else(|| Error::UnknownLayer(name.to_owned()))?;
        Ok((generated, target))
    }
}

/// `d/dF mean((G - A)^2) * scale`, with `G = F·Fᵀ / N`, which works out to
/// `4 (G - A) F / (C² N) * scale` since both Gram matrices are symmetric
fn style_gradient(features: &Tensor, gram: &Gram, target: &Gram, scale: f32) -> Tensor {
    let shape = features.shape();
    let channels = shape.channels;
    let coefficient =
        4.0 * scale / ((channels * channels) as f32 * shape.plane().max(1) as f32);

    let mut grad = Tensor::zeros(shape);
    for k in 0..channels {
        let row = grad.channel_mut(k);
        for j in 0..channels {
            let d = (gram.get(k, j) - target.get(k, j)) * coefficient;
            for (g, f) in row.iter_mut().zip(features.channel(j)) {
                *g += d * f;
            }
        }
    }

    grad
}

fn add_layer_grad(grads: &mut FeatureMaps, name: &str, grad: Tensor) {
    match grads.get_mut(name) {
        Some(existing) => existing.add_scaled(&grad, 1.0),
        None => grads.insert(name, grad),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{network::Network, tensor::Shape};

    fn tensor(shape: Shape, f: impl Fn(usize) -> f32) -> Tensor {
        Tensor::from_vec(shape, (0..shape.len()).map(f).collect()).unwrap()
    }

    fn net() -> Network {
        Network::builder(3)
            .seed(3)
            .conv("conv1", 4, 3)
            .max_pool("pool1")
            .conv("conv2", 6, 3)
            .build()
            .unwrap()
            .with_max_thread_count(1)
    }

    fn image_tensor(offset: usize) -> Tensor {
        tensor(Shape::new(3, 8, 8), |i| (((i + offset) * 31) % 23) as f32 - 11.0)
    }

    #[test]
    fn content_loss_of_identical_is_zero() {
        let t = image_tensor(0);
        assert_eq!(content_loss(&t, &t), 0.0);
    }

    #[test]
    fn style_loss_of_identical_is_zero() {
        let g = Gram::from_features(&image_tensor(4));
        assert_eq!(style_loss(&g, &g), 0.0);
    }

    #[test]
    fn self_targets_give_zero_loss_on_every_layer() {
        let net = net();
        let img = image_tensor(0);
        let layers = LayerSet::new(vec!["conv1", "pool1", "conv2"]);

        let targets = Targets::compute(&net, &img, &img, &layers, &layers).unwrap();
        let engine = LossEngine::new(&net, &targets, LossWeights::default());

        let eval = engine.evaluate(&img).unwrap();
        assert!(eval.loss.content.abs() < 1e-6);
        assert!(eval.loss.style.abs() < 1e-6);
        assert!(eval.gradient.as_slice().iter().all(|g| g.abs() < 1e-6));
    }

    #[test]
    fn total_is_weighted_sum() {
        let net = net();
        let layers = LayerSet::new(vec!["conv1", "conv2"]);
        let targets =
            Targets::compute(&net, &image_tensor(0), &image_tensor(9), &layers, &layers).unwrap();

        let weights = LossWeights {
            content: 2.5,
            style: 0.5,
        };
        let loss = LossEngine::new(&net, &targets, weights)
            .loss(&image_tensor(3))
            .unwrap();

        let expected = 2.5 * loss.content + 0.5 * loss.style;
        assert!((loss.total - expected).abs() <= 1e-4 * expected.abs());
    }

    #[test]
    fn style_layers_are_averaged_and_content_layers_summed() {
        let net = net();
        let c = image_tensor(0);
        let s = image_tensor(9);
        let g = image_tensor(3);
        let weights = LossWeights {
            content: 1.0,
            style: 1.0,
        };

        let single = |layer: &str| {
            let layers = LayerSet::new(vec![layer]);
            let targets = Targets::compute(&net, &c, &s, &layers, &layers).unwrap();
            LossEngine::new(&net, &targets, weights).loss(&g).unwrap()
        };

        let both = LayerSet::new(vec!["conv1", "conv2"]);
        let targets = Targets::compute(&net, &c, &s, &both, &both).unwrap();
        let combined = LossEngine::new(&net, &targets, weights).loss(&g).unwrap();

        let (a, b) = (single("conv1"), single("conv2"));
        assert!((combined.content - (a.content + b.content)).abs() < 1e-3 * combined.content);
        assert!((combined.style - (a.style + b.style) / 2.0).abs() < 1e-3 * combined.style);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let net = net();
        let content_layers = LayerSet::new(vec!["conv2"]);
        let style_layers = LayerSet::new(vec!["conv1", "conv2"]);
        let targets = Targets::compute(
            &net,
            &image_tensor(0),
            &image_tensor(9),
            &content_layers,
            &style_layers,
        )
        .unwrap();

        let weights = LossWeights {
            content: 1.0,
            style: 1e-2,
        };
        let engine = LossEngine::new(&net, &targets, weights);

        let generated = image_tensor(5);
        let eval = engine.evaluate(&generated).unwrap();

        let eps = 1e-3;
        for &index in &[1, 17, 64, 100, 150] {
            let mut plus = generated.clone();
            plus.as_mut_slice()[index] += eps;
            let mut minus = generated.clone();
            minus.as_mut_slice()[index] -= eps;

            let numeric = (f64::from(engine.loss(&plus).unwrap().total)
                - f64::from(engine.loss(&minus).unwrap().total))
                / (2.0 * f64::from(eps));
            let analytic = f64::from(eval.gradient.as_slice()[index]);

            assert!(
                (numeric - analytic).abs() <= 2e-2 * numeric.abs().max(analytic.abs()) + 1e-3,
                "index {}: numeric {} analytic {}",
                index,
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn content_gradient_points_toward_target() {
        // with a single identity layer, the gradient is just 2 (x - p) / n
        let mut weights = vec![0.0; 9];
        weights[4] = 1.0;
        let net = Network::builder(1)
            .conv_with_weights("id", 1, 3, false, weights, vec![0.0])
            .build()
            .unwrap();

        let layers = LayerSet::new(vec!["id"]);
        let target = tensor(Shape::new(1, 2, 2), |_| 4.0);
        let generated = tensor(Shape::new(1, 2, 2), |i| i as f32);
        let targets = Targets::compute(&net, &target, &target, &layers, &layers).unwrap();

        let engine = LossEngine::new(
            &net,
            &targets,
            LossWeights {
                content: 1.0,
                style: 1e-9,
            },
        );
        let eval = engine.evaluate(&generated).unwrap();

        for (i, g) in eval.gradient.as_slice().iter().enumerate() {
            let expected = 2.0 * (i as f32 - 4.0) / 4.0;
            assert!((g - expected).abs() < 1e-3, "{} vs {}", g, expected);
        }
    }
}
