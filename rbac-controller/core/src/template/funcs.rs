use super::context::Value;
use std::{borrow::Cow, collections::BTreeMap};

/// The functions a template may call.
///
/// Names are resolved while parsing so that a call to an unknown function is a
/// syntax error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Func {
    /// `default FALLBACK VALUE`
    Default,
    /// `hasKey MAP KEY`
    HasKey,
    /// `getOrDefault MAP KEY FALLBACK`
    GetOrDefault,
}

// === impl Func ===

impl Func {
    pub(super) fn lookup(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::Default),
            "hasKey" => Some(Self::HasKey),
            "getOrDefault" => Some(Self::GetOrDefault),
            _ => None,
        }
    }

    pub(super) fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::HasKey => "hasKey",
            Self::GetOrDefault => "getOrDefault",
        }
    }

    pub(super) fn call<'a>(self, args: Vec<Value<'a>>) -> Result<Value<'a>, String> {
        match self {
            Self::Default => {
                let [fallback, value] = self.arity(args)?;
                match value {
                    Value::Nil => Ok(fallback),
                    Value::Str(s) if s.is_empty() => Ok(fallback),
                    value => Ok(value),
                }
            }

            Self::HasKey => {
                let [map, key] = self.arity(args)?;
                let map = self.map_arg(map)?;
                let key = self.str_arg(key)?;
                Ok(Value::Bool(map.is_some_and(|m| m.contains_key(&*key))))
            }

            Self::GetOrDefault => {
                let [map, key, fallback] = self.arity(args)?;
                let map = self.map_arg(map)?;
                let key = self.str_arg(key)?;
                let fallback = self.str_arg(fallback)?;
                let value = match map.and_then(|m| m.get(&*key)) {
                    Some(v) => Cow::Borrowed(v.as_str()),
                    None => fallback,
                };
                Ok(Value::Str(value))
            }
        }
    }

    fn arity<'a, const N: usize>(self, args: Vec<Value<'a>>) -> Result<[Value<'a>; N], String> {
        args.try_into().map_err(|args: Vec<Value<'a>>| {
            format!(
                "wrong number of args for {}: want {N} got {}",
                self.name(),
                args.len()
            )
        })
    }

    fn map_arg<'a>(self, value: Value<'a>) -> Result<Option<&'a BTreeMap<String, String>>, String> {
        match value {
            Value::Map(m) => Ok(Some(m)),
            Value::Nil => Ok(None),
            v => Err(format!(
                "wrong type for value in {}; expected map[string]string; got {}",
                self.name(),
                v.type_name()
            )),
        }
    }

    fn str_arg<'a>(self, value: Value<'a>) -> Result<Cow<'a, str>, String> {
        match value {
            Value::Str(s) => Ok(s),
            v => Err(format!(
                "wrong type for value in {}; expected string; got {}",
                self.name(),
                v.type_name()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, convert_args};

    fn s(v: &str) -> Value<'_> {
        Value::Str(Cow::Borrowed(v))
    }

    #[test]
    fn default_replaces_nil_and_empty() {
        let f = Func::Default;
        assert_eq!(f.call(vec![s("d"), Value::Nil]).unwrap(), s("d"));
        assert_eq!(f.call(vec![s("d"), s("")]).unwrap(), s("d"));
        assert_eq!(f.call(vec![s("d"), s("v")]).unwrap(), s("v"));
        assert_eq!(
            f.call(vec![s("d"), Value::Bool(false)]).unwrap(),
            Value::Bool(false)
        );
        assert!(f.call(vec![s("d")]).is_err());
    }

    #[test]
    fn has_key_tolerates_nil() {
        let map = convert_args!(btreemap!("k" => "v"));
        let f = Func::HasKey;
        assert_eq!(
            f.call(vec![Value::Map(&map), s("k")]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            f.call(vec![Value::Map(&map), s("x")]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            f.call(vec![Value::Nil, s("k")]).unwrap(),
            Value::Bool(false)
        );
        assert!(f.call(vec![s("not a map"), s("k")]).is_err());
    }

    #[test]
    fn get_or_default_tolerates_nil() {
        let map = convert_args!(btreemap!("k" => "v"));
        let f = Func::GetOrDefault;
        assert_eq!(
            f.call(vec![Value::Map(&map), s("k"), s("d")]).unwrap(),
            s("v")
        );
        assert_eq!(
            f.call(vec![Value::Map(&map), s("x"), s("d")]).unwrap(),
            s("d")
        );
        assert_eq!(f.call(vec![Value::Nil, s("k"), s("d")]).unwrap(), s("d"));
    }

    #[test]
    fn unknown_names() {
        assert_eq!(Func::lookup("default"), Some(Func::Default));
        assert_eq!(Func::lookup("printf"), None);
    }
}
