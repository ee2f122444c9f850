//! Label decoding for classifier outputs

use crate::error::ScoreError;
use serde::{Deserialize, Serialize};

/// Maps integer class ids back to the category names used in training
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelDecoder {
    classes: Vec<String>,
}

impl LabelDecoder {
    pub fn new<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            classes: classes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Decode one class id
    pub fn decode(&self, class_id: i64) -> Result<&str, ScoreError> {
        usize::try_from(class_id)
            .ok()
            .and_then(|idx| self.classes.get(idx))
            .map(String::as_str)
            .ok_or(ScoreError::UnknownClass(class_id))
    }

    /// Decode a whole classifier output, failing on the first unknown id
    pub fn decode_all(&self, class_ids: &[i64]) -> Result<Vec<String>, ScoreError> {
        class_ids
            .iter()
            .map(|&id| self.decode(id).map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_classes() {
        let decoder = LabelDecoder::new(["Benign", "DDoS", "PortScan"]);
        assert_eq!(decoder.decode(0).unwrap(), "Benign");
        assert_eq!(decoder.decode(2).unwrap(), "PortScan");
    }

    #[test]
    fn test_decode_unknown_class() {
        let decoder = LabelDecoder::new(["Benign", "DDoS"]);
        assert!(matches!(decoder.decode(2), Err(ScoreError::UnknownClass(2))));
        assert!(matches!(decoder.decode(-1), Err(ScoreError::UnknownClass(-1))));
    }

    #[test]
    fn test_decode_all_fails_on_first_unknown() {
        let decoder = LabelDecoder::new(["Benign", "DDoS"]);
        assert_eq!(
            decoder.decode_all(&[1, 0, 1]).unwrap(),
            vec!["DDoS", "Benign", "DDoS"]
        );
        assert!(decoder.decode_all(&[0, 7]).is_err());
    }

    #[test]
    fn test_deserialize() {
        let decoder: LabelDecoder =
            serde_json::from_str(r#"{"classes": ["Benign", "Bot"]}"#).unwrap();
        assert_eq!(decoder.classes().len(), 2);
    }
}
