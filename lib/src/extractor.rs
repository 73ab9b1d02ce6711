use crate::{tensor::Tensor, Error};

/// An ordered set of layer names, without duplicates
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerSet {
    names: Vec<String>,
}

impl LayerSet {
    pub fn new<S: Into<String>, I: IntoIterator<Item = S>>(names: I) -> Self {
        let mut set = Self::default();
        for name in names {
            set.insert(name);
        }
        set
    }

    /// Appends a layer, returns false if it was already present
    pub fn insert<S: Into<String>>(&mut self, name: S) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.names.push(name);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Returns the names in `self` that are also in `other`, in `self`'s order
    pub fn intersection<'a>(&'a self, other: &'a LayerSet) -> impl Iterator<Item = &'a str> {
        self.iter().filter(move |n| other.contains(n))
    }

    /// Returns the first name that `extractor` doesn't provide
    pub(crate) fn first_unknown(&self, extractor: &dyn FeatureExtractor) -> Option<&str> {
        let known = extractor.layer_names();
        self.iter().find(|n| !known.contains(n))
    }
}

impl<S: Into<String>> std::iter::FromIterator<S> for LayerSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Activations of a set of layers, keyed by layer name
#[derive(Clone, Debug, Default)]
pub struct FeatureMaps {
    maps: Vec<(String, Tensor)>,
}

impl FeatureMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the tensor for a layer
    pub fn insert<S: Into<String>>(&mut self, name: S, tensor: Tensor) {
        let name = name.into();
        match self.maps.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = tensor,
            None => self.maps.push((name, tensor)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.maps.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.maps
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.maps.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

/// A frozen, differentiable image feature extractor.
///
/// Implementations must be pure: the same input always produces the same
/// activations, and nothing about the extractor changes between calls. This
/// is what allows a single extractor to be shared between any number of
/// concurrent sessions.
pub trait FeatureExtractor: Send + Sync {
    /// The names of the layers whose activations can be extracted, in
    /// network order
    fn layer_names(&self) -> Vec<&str>;

    /// The number of channels the input tensor must have
    fn input_channels(&self) -> usize;

    /// Runs the network on `input` and returns the activations of each of
    /// the requested `layers`
    fn extract(&self, input: &Tensor, layers: &LayerSet) -> Result<FeatureMaps, Error>;

    /// Given the gradient of a scalar with respect to the activations of
    /// one or more layers, computes the gradient of that scalar with respect
    /// to `input`
    fn backward(&self, input: &Tensor, output_grads: &FeatureMaps) -> Result<Tensor, Error>;

    /// The smallest width and height an input can have for all of `layers`
    /// to be computed
    fn min_input_size(&self, _layers: &LayerSet) -> usize {
        1
    }
}

impl<T: FeatureExtractor + ?Sized> FeatureExtractor for std::sync::Arc<T> {
    fn layer_names(&self) -> Vec<&str> {
        (**self).layer_names()
    }

    fn input_channels(&self) -> usize {
        (**self).input_channels()
    }

    fn extract(&self, input: &Tensor, layers: &LayerSet) -> Result<FeatureMaps, Error> {
        (**self).extract(input, layers)
    }

    fn backward(&self, input: &Tensor, output_grads: &FeatureMaps) -> Result<Tensor, Error> {
        (**self).backward(input, output_grads)
    }

    fn min_input_size(&self, layers: &LayerSet) -> usize {
        (**self).min_input_size(layers)
    }
}
