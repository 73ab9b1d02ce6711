use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) what: &'static str,
    pub(crate) expected: String,
    pub(crate) actual: String,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} has shape {}, but {} was expected",
            self.what, self.actual, self.expected
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// A content or style layer set was empty
    EmptyLayerSet(&'static str),
    /// A layer name that the feature extractor doesn't know about
    UnknownLayer(String),
    /// A tensor didn't have the shape an operation required
    ShapeMismatch(ShapeMismatch),
    /// No content or style image was added to the session
    MissingImage(&'static str),
    /// A network weights file was malformed
    InvalidNetwork(String),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
}

impl Error {
    /// Returns true for errors caused by the parameters of a session rather
    /// than by the content of its inputs
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidRange(_)
                | Self::EmptyLayerSet(_)
                | Self::UnknownLayer(_)
                | Self::MissingImage(_)
                | Self::UnsupportedOutputFormat(_)
        )
    }

    /// Returns true for errors caused by undecodable or malformed inputs
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            Self::Image(_) | Self::Io(_) | Self::ShapeMismatch(_) | Self::InvalidNetwork(_)
        )
    }

    pub(crate) fn shape(
        what: &'static str,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        Self::ShapeMismatch(ShapeMismatch {
            what,
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::EmptyLayerSet(which) => {
                write!(f, "at least 1 {} layer must be selected", which)
            }
            Self::UnknownLayer(name) => {
                write!(f, "the network has no layer named '{}'", name)
            }
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::MissingImage(which) => write!(f, "no {} image was provided", which),
            Self::InvalidNetwork(msg) => write!(f, "invalid network weights: {}", msg),
            Self::Io(io) => write!(f, "{}", io),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert!(Error::UnknownLayer("block9_conv1".to_owned()).is_configuration());
        assert!(Error::EmptyLayerSet("style").is_configuration());
        assert!(!Error::EmptyLayerSet("style").is_input());

        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "nope"));
        assert!(io.is_input());
        assert!(!io.is_configuration());
    }

    #[test]
    fn formats_invalid_range() {
        let err = Error::InvalidRange(InvalidRange {
            min: 0.0,
            max: f32::MAX,
            value: -1.0,
            name: "style-weight",
        });

        assert!(err.to_string().starts_with("parameter 'style-weight' - value '-1'"));
    }
}
