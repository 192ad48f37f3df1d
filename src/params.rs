use serde_json::{Map, Value};

/// The values a prompt is rendered against.
///
/// Parameters are never modified by a render; loop bindings live in a
/// [`Scope`] layered on top.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Parameters {
    data: Map<String, Value>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<N: Into<String>, V: Into<Value>>(&mut self, name: N, value: V) -> &mut Self {
        self.data.insert(name.into(), value.into());
        self
    }

    pub fn get<T: AsRef<str>>(&self, name: T) -> Option<&Value> {
        self.data.get(name.as_ref())
    }

    pub fn contains<T: AsRef<str>>(&self, name: T) -> bool {
        self.data.contains_key(name.as_ref())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }
}

impl From<Map<String, Value>> for Parameters {
    fn from(data: Map<String, Value>) -> Self {
        Self { data }
    }
}

impl TryFrom<Value> for Parameters {
    type Error = Value;

    /// Succeeds for JSON objects; any other value is handed back.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(data) => Ok(Self { data }),
            Value::Null
            | Value::Bool(_)
            | Value::Number(_)
            | Value::String(_)
            | Value::Array(_) => Err(value),
        }
    }
}

impl<N: Into<String>, V: Into<Value>> FromIterator<(N, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            data: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

/// Bindings visible at a point in the tree walk.
///
/// An immutable association list: each `for` iteration pushes frames that
/// live only as long as that iteration.
#[derive(Debug)]
pub(crate) enum Scope<'a> {
    Root(&'a Parameters),
    Binding {
        parent: &'a Scope<'a>,
        name: &'a str,
        value: Value,
    },
}

impl<'a> Scope<'a> {
    pub(crate) const fn new(parameters: &'a Parameters) -> Self {
        Self::Root(parameters)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<&Value> {
        let mut scope = self;
        loop {
            match scope {
                Self::Root(parameters) => return parameters.get(name),
                Self::Binding {
                    parent,
                    name: bound,
                    value,
                } => {
                    if *bound == name {
                        return Some(value);
                    }
                    scope = *parent;
                }
            }
        }
    }

    pub(crate) fn bind<'s>(&'s self, name: &'s str, value: Value) -> Scope<'s> {
        Scope::Binding {
            parent: self,
            name,
            value,
        }
    }
}
