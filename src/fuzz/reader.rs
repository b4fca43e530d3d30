//! Replay of a harness's consumption sequence over raw fuzz bytes.

use super::{ConstantBinding, CorpusEntry, FuzzedDataProvider, PrimitiveKind, Value};
use super::{INT_WIDTH, STRING_WIDTH};

/// Decodes raw fuzz inputs into the values a harness consumed.
///
/// Steps are the harness's provider calls in execution order. A name that is
/// assigned twice consumes twice; the later value wins in the mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reader {
    steps: Vec<ConstantBinding>,
}

impl Reader {
    pub fn new(steps: Vec<ConstantBinding>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[ConstantBinding] {
        &self.steps
    }

    /// Decode one raw input. Never fails; exhausted input decodes to defaults.
    pub fn read(&self, data: &[u8]) -> CorpusEntry {
        let mut fdp = FuzzedDataProvider::new(data);
        let mut entry = CorpusEntry::new();
        for step in &self.steps {
            let value = match step.kind {
                PrimitiveKind::Int => Value::Int(fdp.consume_int(INT_WIDTH)),
                PrimitiveKind::Float => Value::Float(fdp.consume_regular_float()),
                PrimitiveKind::Str => Value::Str(fdp.consume_string(STRING_WIDTH)),
                PrimitiveKind::Bool => Value::Bool(fdp.consume_bool()),
            };
            entry.insert(step.name.clone(), value);
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reader(steps: &[(&str, PrimitiveKind)]) -> Reader {
        Reader::new(
            steps
                .iter()
                .map(|(name, kind)| ConstantBinding::new(*name, *kind))
                .collect(),
        )
    }

    #[test]
    fn test_read_single_int() {
        let r = reader(&[("x", PrimitiveKind::Int)]);
        let entry = r.read(&[0x2a, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(entry.len(), 1);
        assert_eq!(entry["x"], Value::Int(42));
    }

    #[test]
    fn test_read_follows_step_order() {
        let r = reader(&[("flag", PrimitiveKind::Bool), ("n", PrimitiveKind::Int)]);
        let entry = r.read(&[0x01, 0x07]);
        assert_eq!(entry["flag"], Value::Bool(true));
        assert_eq!(entry["n"], Value::Int(7));
    }

    #[test]
    fn test_read_repeated_name_last_wins() {
        let r = reader(&[("x", PrimitiveKind::Int), ("x", PrimitiveKind::Str)]);
        let entry = r.read(&[0u8; 32]);
        assert_eq!(entry.len(), 1);
        assert_eq!(entry["x"].kind(), PrimitiveKind::Str);
    }

    #[test]
    fn test_read_empty_input() {
        let r = reader(&[
            ("i", PrimitiveKind::Int),
            ("f", PrimitiveKind::Float),
            ("s", PrimitiveKind::Str),
            ("b", PrimitiveKind::Bool),
        ]);
        let entry = r.read(&[]);
        assert_eq!(entry["i"], Value::Int(0));
        assert_eq!(entry["f"], Value::Float(f64::MIN));
        assert_eq!(entry["s"], Value::Str(String::new()));
        assert_eq!(entry["b"], Value::Bool(false));
    }

    fn kind_strategy() -> impl Strategy<Value = PrimitiveKind> {
        prop_oneof![
            Just(PrimitiveKind::Int),
            Just(PrimitiveKind::Float),
            Just(PrimitiveKind::Str),
            Just(PrimitiveKind::Bool),
        ]
    }

    proptest! {
        #[test]
        fn test_read_any_bytes_yields_declared_bindings(
            kinds in prop::collection::vec(kind_strategy(), 0..8),
            data in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let steps: Vec<ConstantBinding> = kinds
                .iter()
                .enumerate()
                .map(|(i, kind)| ConstantBinding::new(format!("v{}", i), *kind))
                .collect();
            let entry = Reader::new(steps.clone()).read(&data);

            prop_assert_eq!(entry.len(), steps.len());
            for step in &steps {
                let value = &entry[&step.name];
                prop_assert_eq!(value.kind(), step.kind);
                if let Value::Float(f) = value {
                    prop_assert!(f.is_finite());
                }
            }
        }

        #[test]
        fn test_read_is_deterministic(data in prop::collection::vec(any::<u8>(), 0..128)) {
            let r = reader(&[("a", PrimitiveKind::Str), ("b", PrimitiveKind::Float)]);
            prop_assert_eq!(r.read(&data), r.read(&data));
        }
    }
}
