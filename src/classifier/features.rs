use crate::error::{MapperError, Result};
use crate::processor::{FlowState, FEATURE_ROW_LEN};

/// Which slots of a flow's feature row are fed to the classifier.
///
/// Indices are kept sorted and de-duplicated. An empty selection means the
/// 24 statistic columns (slots 1..=24) in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSelection {
    indices: Vec<usize>,
}

impl FeatureSelection {
    pub fn new(indices: impl IntoIterator<Item = usize>) -> Result<Self> {
        let mut indices: Vec<usize> = indices.into_iter().collect();
        if let Some(bad) = indices.iter().find(|&&i| i == 0 || i >= FEATURE_ROW_LEN) {
            return Err(MapperError::Config(format!(
                "feature index {bad} is out of range 1..={}",
                FEATURE_ROW_LEN - 1
            )));
        }
        indices.sort_unstable();
        indices.dedup();
        Ok(Self { indices })
    }

    /// Accepts indices given as separate arguments, comma separated, or both.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut indices = Vec::new();
        for token in args.iter().flat_map(|a| a.as_ref().split(',')) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let idx = token
                .parse::<usize>()
                .map_err(|e| MapperError::Config(format!("bad feature index '{token}': {e}")))?;
            indices.push(idx);
        }
        Self::new(indices)
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn is_default(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn width(&self) -> usize {
        if self.indices.is_empty() { 24 } else { self.indices.len() }
    }

    pub fn extract(&self, flow: &FlowState) -> Vec<f32> {
        let row = flow.feature_row();
        if self.indices.is_empty() {
            row[1..25].iter().map(|&v| as_f32(v)).collect()
        } else {
            self.indices.iter().map(|&i| as_f32(row[i])).collect()
        }
    }
}

#[inline]
fn as_f32(v: f64) -> f32 {
    let f = v as f32;
    if f.is_finite() { f } else { 0.0 }
}
