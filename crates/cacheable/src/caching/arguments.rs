use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The raw arguments of a single call, as passed by the caller.
///
/// A position holding `None` was omitted by the caller and is replaced by the declared default
/// of that parameter during normalization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Arguments(Vec<Option<Value>>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a supplied argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.0.push(Some(value.into()));
        self
    }

    /// Appends an omitted argument.
    pub fn omitted(mut self) -> Self {
        self.0.push(None);
        self
    }

    /// Appends the serialized form of `value`.
    pub fn serialized<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        Ok(self.arg(serde_json::to_value(value)?))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<()> for Arguments {
    fn from(_: ()) -> Self {
        Self::new()
    }
}

impl From<Vec<Option<Value>>> for Arguments {
    fn from(args: Vec<Option<Value>>) -> Self {
        Self(args)
    }
}

impl From<Vec<Value>> for Arguments {
    fn from(args: Vec<Value>) -> Self {
        Self(args.into_iter().map(Some).collect())
    }
}

impl From<&str> for Arguments {
    fn from(arg: &str) -> Self {
        Self::new().arg(arg)
    }
}

impl From<Value> for Arguments {
    fn from(arg: Value) -> Self {
        Self::new().arg(arg)
    }
}

/// A comparison-ready argument tuple.
///
/// The tuple exclusively owns its values, so no mutation by the caller after the call can change
/// the key a cached result is stored under.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedArgs(Vec<Value>);

impl NormalizedArgs {
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Deserializes the argument at `index`.
    ///
    /// Missing positions deserialize from `null`.
    pub fn get_as<T: DeserializeOwned>(&self, index: usize) -> Result<T, serde_json::Error> {
        T::deserialize(self.0.get(index).unwrap_or(&Value::Null))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl<'a> IntoIterator for &'a NormalizedArgs {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<Vec<Value>> for NormalizedArgs {
    fn from(args: Vec<Value>) -> Self {
        Self(args)
    }
}

/// Turns raw [`Arguments`] into [`NormalizedArgs`] using the declared parameter defaults of a
/// call site.
///
/// The output is padded to the declared arity, so a call that omits trailing arguments is
/// identical to one that supplies their defaults explicitly. Omitted positions without a declared
/// default become `null`.
#[derive(Clone, Debug, Default)]
pub struct ArgumentNormalizer {
    defaults: Vec<Option<Value>>,
}

impl ArgumentNormalizer {
    pub fn new(defaults: Vec<Option<Value>>) -> Self {
        Self { defaults }
    }

    pub fn normalize(&self, args: Arguments) -> NormalizedArgs {
        let arity = args.0.len().max(self.defaults.len());
        let mut supplied = args.0.into_iter();

        let normalized = (0..arity)
            .map(|index| match supplied.next().flatten() {
                Some(value) => value,
                None => self
                    .defaults
                    .get(index)
                    .cloned()
                    .flatten()
                    .unwrap_or(Value::Null),
            })
            .collect();

        NormalizedArgs(normalized)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_omitted_arguments_take_defaults() {
        let normalizer = ArgumentNormalizer::new(vec![
            Some(json!("Parameter1")),
            Some(json!("Parameter2")),
        ]);

        let omitted = normalizer.normalize(Arguments::new().omitted().omitted());
        let missing = normalizer.normalize(Arguments::new());
        let explicit = normalizer.normalize(Arguments::new().arg("Parameter1").arg("Parameter2"));

        assert_eq!(omitted.as_slice(), &[json!("Parameter1"), json!("Parameter2")]);
        assert_eq!(omitted, missing);
        assert_eq!(omitted, explicit);
    }

    #[test]
    fn test_omitted_without_default_is_null() {
        let normalizer = ArgumentNormalizer::new(vec![None, Some(json!(""))]);
        let args = normalizer.normalize(Arguments::new().omitted());
        assert_eq!(args.as_slice(), &[Value::Null, json!("")]);
    }

    #[test]
    fn test_extra_arguments_are_kept() {
        let normalizer = ArgumentNormalizer::new(vec![Some(json!(1))]);
        let args = normalizer.normalize(Arguments::new().arg(2).arg(json!({"straight": true})));
        assert_eq!(args.len(), 2);
        assert_eq!(args.get_as::<u32>(0).unwrap(), 2);
        assert_eq!(args.get(1), Some(&json!({"straight": true})));
    }

    #[test]
    fn test_normalized_args_do_not_alias_caller_values() {
        #[derive(Serialize)]
        struct Params {
            number: Vec<u32>,
        }

        let normalizer = ArgumentNormalizer::default();
        let mut params = Params { number: vec![1] };
        let first = normalizer.normalize(Arguments::new().serialized(&params).unwrap());

        params.number.push(2);
        let second = normalizer.normalize(Arguments::new().serialized(&params).unwrap());

        assert_eq!(first.get(0), Some(&json!({"number": [1]})));
        assert_ne!(first, second);
    }
}
