// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` is a light API for neural style transfer: it optimizes an
//! image so that it keeps the structure of a content image while taking on
//! the textures and colors of a style image.
//!
//! Both images are run through a frozen convolutional network. The content
//! of an image is described by the activations of its deeper layers, and its
//! style by the Gram matrices (channel correlations) of a set of layers.
//! Starting from the content image, the generated image is updated by
//! gradient descent on a weighted sum of both losses.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the
//! builder pattern. Calling `build` on the `SessionBuilder` validates the
//! parameters and loads the input images.
//!
//! `Session` has a `run()` method that computes the targets and optimizes the
//! image, returning a `RunResult` with the best image that was found.
//!
//! ## Feature extractors
//!
//! The optimizer works with any `FeatureExtractor`. The crate ships with
//! `Network`, a CPU implementation of plain convolutional networks such as
//! VGG16, which can be built layer by layer or loaded from a weights file.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! let mut weights = std::fs::File::open("vgg16.nsw").expect("failed to open weights");
//! let network = neural_style::Network::read(&mut weights).expect("invalid weights");
//!
//! let session = neural_style::Session::builder()
//!     .extractor(Arc::new(network))
//!     .content(&"imgs/house.jpg")
//!     .style(&"imgs/starry-night.jpg")
//!     .content_weight(1e3)
//!     .style_weight(1e-2)
//!     .iterations(200)
//!     .build().expect("failed to build session");
//!
//! let result = session.run(None, None).expect("failed to compute targets");
//! result.save("stylized.jpg").expect("failed to save image");
//! ```
mod errors;
mod extractor;
mod loss;
mod network;
mod optimizer;
mod preprocess;
pub mod session;
mod tensor;
mod utils;

use optimizer::{LoopConfig, Optimization, OptimizerSettings};

pub use image;
use std::path::Path;

pub use errors::Error;
pub use extractor::{FeatureExtractor, FeatureMaps, LayerSet};
pub use loss::{content_loss, style_loss, Evaluation, LossBreakdown, LossEngine, LossWeights, Targets};
pub use network::{Conv2d, Network, NetworkBuilder, VGG16_LAYERS};
pub use optimizer::{LoopState, OptimizerKind, RunFailure, Snapshot};
pub use preprocess::{Normalization, VGG_MEANS_BGR};
pub use session::{
    CancelToken, ChannelProgress, ProgressEvent, ProgressStat, ProgressUpdate, RunProgress,
    RunResult, RunStatus, Session, SessionBuilder,
};
pub use tensor::{Gram, Shape, Tensor};
pub use utils::{load_dynamic_image, load_image, ImageSource};

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Dims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
