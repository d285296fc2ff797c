//! Serde helpers for the hosts file.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::de::{self, value::MapAccessDeserializer, MapAccess, Unexpected, Visitor};
use serde::{Deserialize, Deserializer};
use void::Void;

/// A hosts file entry is either shorthand (`[user@]hostname[:port]`) or a full mapping.
/// https://serde.rs/string-or-struct.html
pub fn shorthand_or_mapping<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de> + FromStr<Err = Void>,
    D: Deserializer<'de>,
{
    struct Entry<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for Entry<T>
    where
        T: Deserialize<'de> + FromStr<Err = Void>,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("`[user@]hostname[:port]` or a mapping with a `hostname` field")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let value = value.trim();
            if value.is_empty() {
                return Err(E::invalid_value(Unexpected::Str(value), &self));
            }
            match T::from_str(value) {
                Ok(entry) => Ok(entry),
                Err(void) => void::unreachable(void),
            }
        }

        fn visit_map<M>(self, map: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            T::deserialize(MapAccessDeserializer::new(map))
        }
    }

    deserializer.deserialize_any(Entry(PhantomData))
}
