//! Typed query intent extracted from a natural-language question.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// The kind of question being asked. Always present on an `Intent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Cheapest,
    MostExpensive,
    HighestRated,
    CostComparison,
    VolumeLeaders,
    MultiProcedureStats,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Cheapest => "cheapest",
            QueryKind::MostExpensive => "most_expensive",
            QueryKind::HighestRated => "highest_rated",
            QueryKind::CostComparison => "cost_comparison",
            QueryKind::VolumeLeaders => "volume_leaders",
            QueryKind::MultiProcedureStats => "multi_procedure_stats",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cheapest" => Some(QueryKind::Cheapest),
            "most_expensive" => Some(QueryKind::MostExpensive),
            "highest_rated" => Some(QueryKind::HighestRated),
            "cost_comparison" => Some(QueryKind::CostComparison),
            "volume_leaders" => Some(QueryKind::VolumeLeaders),
            "multi_procedure_stats" => Some(QueryKind::MultiProcedureStats),
            _ => None,
        }
    }
}

/// Structured parameters for one request. Constructed once per question
/// and immutable after binding.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Intent {
    pub query_kind: QueryKind,
    pub procedure_text: Option<String>,
    /// 3-4 character numeric DRG code, kept as text (the column is text).
    pub drg_code: Option<String>,
    /// Two-letter uppercase state code.
    pub state: Option<String>,
    pub city: Option<String>,
    pub zip_code: Option<String>,
    #[validate(range(min = 1.0, max = 10.0))]
    pub min_rating: Option<f64>,
    #[validate(range(exclusive_min = 0.0))]
    pub max_cost: Option<f64>,
    pub limit: i64,
    /// Set when extraction fell back to the default intent.
    pub degraded: bool,
}

impl Default for Intent {
    fn default() -> Self {
        Self {
            query_kind: QueryKind::Cheapest,
            procedure_text: None,
            drg_code: None,
            state: None,
            city: None,
            zip_code: None,
            min_rating: None,
            max_cost: None,
            limit: 10,
            degraded: false,
        }
    }
}

impl Intent {
    /// Fallback intent used when the extractor cannot produce one.
    pub fn degraded_default() -> Self {
        Self {
            degraded: true,
            ..Self::default()
        }
    }

    /// Whether the intent carries a procedure reference (free text or code).
    pub fn has_procedure_scope(&self) -> bool {
        self.procedure_text.is_some() || self.drg_code.is_some()
    }

    /// Number of fields a template binder could draw a constant from.
    /// Used as the tie-break hint when two template matches score equally.
    pub fn bindable_field_count(&self) -> usize {
        let mut count = 1; // limit is always bindable
        if self.has_procedure_scope() {
            count += 1;
        }
        if self.state.is_some() {
            count += 1;
        }
        if self.city.is_some() {
            count += 1;
        }
        if self.zip_code.is_some() {
            count += 1;
        }
        if self.min_rating.is_some() {
            count += 1;
        }
        if self.max_cost.is_some() {
            count += 1;
        }
        count
    }
}

/// Expand full US state names to two-letter codes. Two-letter inputs are
/// uppercased; anything unrecognized passes through untouched and will
/// simply fail to match downstream.
pub fn normalize_state(state: &str) -> String {
    let trimmed = state.trim();
    if trimmed.len() == 2 {
        return trimmed.to_uppercase();
    }
    match trimmed.to_lowercase().as_str() {
        "alabama" => "AL",
        "alaska" => "AK",
        "arizona" => "AZ",
        "arkansas" => "AR",
        "california" => "CA",
        "colorado" => "CO",
        "connecticut" => "CT",
        "delaware" => "DE",
        "district of columbia" => "DC",
        "florida" => "FL",
        "georgia" => "GA",
        "hawaii" => "HI",
        "idaho" => "ID",
        "illinois" => "IL",
        "indiana" => "IN",
        "iowa" => "IA",
        "kansas" => "KS",
        "kentucky" => "KY",
        "louisiana" => "LA",
        "maine" => "ME",
        "maryland" => "MD",
        "massachusetts" => "MA",
        "michigan" => "MI",
        "minnesota" => "MN",
        "mississippi" => "MS",
        "missouri" => "MO",
        "montana" => "MT",
        "nebraska" => "NE",
        "nevada" => "NV",
        "new hampshire" => "NH",
        "new jersey" => "NJ",
        "new mexico" => "NM",
        "new york" => "NY",
        "north carolina" => "NC",
        "north dakota" => "ND",
        "ohio" => "OH",
        "oklahoma" => "OK",
        "oregon" => "OR",
        "pennsylvania" => "PA",
        "rhode island" => "RI",
        "south carolina" => "SC",
        "south dakota" => "SD",
        "tennessee" => "TN",
        "texas" => "TX",
        "utah" => "UT",
        "vermont" => "VT",
        "virginia" => "VA",
        "washington" => "WA",
        "west virginia" => "WV",
        "wisconsin" => "WI",
        "wyoming" => "WY",
        _ => return trimmed.to_string(),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_normalization() {
        assert_eq!(normalize_state("New York"), "NY");
        assert_eq!(normalize_state("texas"), "TX");
        assert_eq!(normalize_state("ny"), "NY");
        assert_eq!(normalize_state("CA"), "CA");
        assert_eq!(normalize_state("Puerto Rico"), "Puerto Rico");
    }

    #[test]
    fn test_query_kind_roundtrip() {
        for kind in [
            QueryKind::Cheapest,
            QueryKind::MostExpensive,
            QueryKind::HighestRated,
            QueryKind::CostComparison,
            QueryKind::VolumeLeaders,
            QueryKind::MultiProcedureStats,
        ] {
            assert_eq!(QueryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(QueryKind::parse("volume_analysis"), None);
    }

    #[test]
    fn test_bindable_field_count() {
        let mut intent = Intent::default();
        assert_eq!(intent.bindable_field_count(), 1);

        intent.drg_code = Some("470".to_string());
        intent.state = Some("NY".to_string());
        assert_eq!(intent.bindable_field_count(), 3);

        intent.procedure_text = Some("hip replacement".to_string());
        // procedure text and DRG code share one bindable slot
        assert_eq!(intent.bindable_field_count(), 3);
    }

    #[test]
    fn test_rating_validation() {
        use validator::Validate;

        let intent = Intent {
            min_rating: Some(11.0),
            ..Intent::default()
        };
        assert!(intent.validate().is_err());

        let intent = Intent {
            min_rating: Some(8.5),
            max_cost: Some(25_000.0),
            ..Intent::default()
        };
        assert!(intent.validate().is_ok());
    }
}
