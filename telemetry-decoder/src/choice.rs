use std::fmt;
use std::sync::Arc;

use regex::Regex;
use telemetry_common::error::ConfigurationError;
use telemetry_common::model::DeviceContext;

use crate::DeviceEventDecoder;

type Predicate = dyn Fn(&DeviceContext) -> bool + Send + Sync;

/// A predicate on the device context paired with the decoder to use when it
/// holds. Choices are evaluated in order and the first match wins.
#[derive(Clone)]
pub struct DecoderChoice {
    name: String,
    predicate: Arc<Predicate>,
    decoder: Arc<dyn DeviceEventDecoder>,
}

impl DecoderChoice {
    pub fn new<P, D>(name: impl Into<String>, predicate: P, decoder: D) -> Self
    where
        P: Fn(&DeviceContext) -> bool + Send + Sync + 'static,
        D: DeviceEventDecoder + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            decoder: Arc::new(decoder),
        }
    }

    /// Matches devices whose type token equals `device_type_token`.
    pub fn for_device_type<D>(device_type_token: impl Into<String>, decoder: D) -> Self
    where
        D: DeviceEventDecoder + 'static,
    {
        let token = device_type_token.into();
        let name = format!("device-type:{token}");
        Self::new(
            name,
            move |context: &DeviceContext| context.device_type().token == token,
            decoder,
        )
    }

    /// Like [`DecoderChoice::for_device_type`], except that `*` in the
    /// pattern matches any run of characters, as in destination mappings.
    pub fn for_device_type_pattern<D>(pattern: &str, decoder: D) -> Result<Self, ConfigurationError>
    where
        D: DeviceEventDecoder + 'static,
    {
        if !pattern.contains('*') {
            return Ok(Self::for_device_type(pattern, decoder));
        }
        let anchored = format!("^{}$", regex::escape(pattern).replace("\\*", ".*"));
        let regex = Regex::new(&anchored).map_err(|e| ConfigurationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(
            format!("device-type:{pattern}"),
            move |context: &DeviceContext| regex.is_match(&context.device_type().token),
            decoder,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, context: &DeviceContext) -> bool {
        (self.predicate)(context)
    }

    pub fn decoder(&self) -> &dyn DeviceEventDecoder {
        self.decoder.as_ref()
    }
}

impl fmt::Debug for DecoderChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderChoice")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
