use crate::error::ModelError;
use crate::parameter::{Parameter, ParameterInit, ParameterSpec};

use std::collections::BTreeMap;

/// Parameters of a single model in declaration order
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterTable {
    names: Vec<&'static str>,
    parameters: Vec<Parameter>,
}

impl ParameterTable {
    /// Build the table from the profile declarations
    ///
    /// Fails if `inits` mentions a parameter the profile doesn't declare.
    pub(crate) fn new(
        model: &str,
        specs: &[ParameterSpec],
        inits: &BTreeMap<String, ParameterInit>,
    ) -> Result<Self, ModelError> {
        if let Some(unknown) = inits
            .keys()
            .find(|name| !specs.iter().any(|spec| spec.name == name.as_str()))
        {
            return Err(ModelError::UnknownParameter {
                model: model.to_owned(),
                parameter: unknown.clone(),
            });
        }
        let parameters = specs
            .iter()
            .map(|spec| {
                Parameter::from_spec(spec, inits.get(spec.name), || {
                    format!("{}:{}", model, spec.name)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            names: specs.iter().map(|spec| spec.name).collect(),
            parameters,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|&n| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.index_of(name).map(|i| &self.parameters[i])
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.index_of(name).map(move |i| &mut self.parameters[i])
    }

    #[inline]
    pub fn name(&self, index: usize) -> &'static str {
        self.names[index]
    }

    #[inline]
    pub fn by_index(&self, index: usize) -> &Parameter {
        &self.parameters[index]
    }

    #[inline]
    pub(crate) fn by_index_mut(&mut self, index: usize) -> &mut Parameter {
        &mut self.parameters[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Parameter)> {
        self.names.iter().copied().zip(self.parameters.iter())
    }

    /// Current values in declaration order, the layout profiles expect
    pub fn values(&self) -> Vec<f64> {
        self.parameters.iter().map(Parameter::value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ParameterDomain;

    const SPECS: [ParameterSpec; 2] = [
        ParameterSpec {
            name: "sky",
            domain: ParameterDomain::Real,
            default: 0.0,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
            description: "",
        },
        ParameterSpec {
            name: "re",
            domain: ParameterDomain::Positive,
            default: 1.0,
            lower: 0.01,
            upper: 100.0,
            description: "",
        },
    ];

    #[test]
    fn declaration_order() {
        let table = ParameterTable::new("m", &SPECS, &BTreeMap::new()).unwrap();
        assert_eq!(table.iter().map(|(n, _)| n).collect::<Vec<_>>(), ["sky", "re"]);
        assert_eq!(table.values(), [0.0, 1.0]);
        assert_eq!(table.index_of("re"), Some(1));
        assert!(table.get("n").is_none());
    }

    #[test]
    fn unknown_init() {
        let inits = BTreeMap::from([("n".to_owned(), ParameterInit::value(1.0))]);
        assert_eq!(
            ParameterTable::new("m", &SPECS, &inits).unwrap_err(),
            ModelError::UnknownParameter {
                model: "m".to_owned(),
                parameter: "n".to_owned()
            }
        );
    }
}
