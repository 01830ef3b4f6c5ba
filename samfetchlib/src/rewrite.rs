use std::collections::BTreeMap;

use log::debug;

/// Aliases that always apply, on top of the user's own table.
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    // Korea-only models, often written without the region letter
    ("SM-F916", "SM-F916N"),
    ("SM-F700", "SM-F700N"),
];

/// Suffixes that only describe a hardware variant and never appear in
/// published model numbers.
const VARIANT_SUFFIXES: &[&str] = &["/DS", "/DSN", "/DSM"];

/// Result of rewriting a model number.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rewrite {
    /// As given by the user. Used for reporting and naming output.
    pub original: String,
    /// Used for every request.
    pub transformed: String,
    pub changed: bool,
}

/// Lookup table of model number aliases.
#[derive(Clone, Debug, Default)]
pub struct ModelRewriter {
    aliases: BTreeMap<String, String>,
}

impl ModelRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add aliases, eg. from the config file. Keys are matched after
    /// normalization, so they may be given in any case.
    pub fn with_aliases<I, K, V>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (k, v) in aliases {
            self.aliases.insert(normalize(k.as_ref()), v.into());
        }
        self
    }

    pub fn rewrite(&self, id: &str) -> Rewrite {
        let key = normalize(id);
        let transformed = self.aliases.get(&key)
            .cloned()
            .or_else(|| BUILTIN_ALIASES.iter()
                .find(|(alias, _)| *alias == key)
                .map(|(_, model)| (*model).to_owned()))
            .unwrap_or_else(|| {
                VARIANT_SUFFIXES.iter()
                    .find_map(|s| key.strip_suffix(s))
                    .map(str::to_owned)
                    .unwrap_or_else(|| id.to_owned())
            });

        let changed = transformed != id;
        if changed {
            debug!("Rewrote model {id:?} to {transformed:?}");
        }

        Rewrite {
            original: id.to_owned(),
            transformed,
            changed,
        }
    }
}

fn normalize(id: &str) -> String {
    id.trim().to_ascii_uppercase()
}
