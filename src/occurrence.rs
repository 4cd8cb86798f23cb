use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

/// Column contract at every stage boundary. Spatial validation checks these
/// names against the filtered table before any spatial processing runs.
pub const CONTRACT_COLUMNS: [&str; 9] = [
    "taxonKey",
    "scientificName",
    "decimalLatitude",
    "decimalLongitude",
    "countryCode",
    "basisOfRecord",
    "coordinateUncertaintyInMeters",
    "year",
    "eventDate",
];

/// One occurrence record as exchanged between the filtering, validation and
/// join stages. Numeric fields deserialize leniently: unparsable source
/// values become `None` instead of failing the row, matching how the raw
/// DwC-A tables mix empty strings and malformed values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OccurrenceRow {
    #[serde(rename = "taxonKey", deserialize_with = "lenient_u64", default)]
    pub taxon_key: Option<u64>,
    #[serde(rename = "scientificName", deserialize_with = "lenient_string", default)]
    pub scientific_name: Option<String>,
    #[serde(rename = "decimalLatitude", deserialize_with = "lenient_f64", default)]
    pub decimal_latitude: Option<f64>,
    #[serde(rename = "decimalLongitude", deserialize_with = "lenient_f64", default)]
    pub decimal_longitude: Option<f64>,
    #[serde(rename = "countryCode", deserialize_with = "lenient_string", default)]
    pub country_code: Option<String>,
    #[serde(rename = "basisOfRecord", deserialize_with = "lenient_string", default)]
    pub basis_of_record: Option<String>,
    #[serde(
        rename = "coordinateUncertaintyInMeters",
        deserialize_with = "lenient_f64",
        default
    )]
    pub coordinate_uncertainty_m: Option<f64>,
    #[serde(rename = "year", deserialize_with = "lenient_i32", default)]
    pub year: Option<i32>,
    #[serde(rename = "eventDate", deserialize_with = "lenient_string", default)]
    pub event_date: Option<String>,
}

impl OccurrenceRow {
    /// Observation date, if `eventDate` carries a parsable calendar date.
    /// GBIF event dates may be full ISO timestamps or intervals; only the
    /// leading `YYYY-MM-DD` is significant for temporal metrics.
    pub fn observation_date(&self) -> Option<NaiveDate> {
        parse_event_date(self.event_date.as_deref()?)
    }

    /// Key used for duplicate removal in the filtering stage.
    pub fn dedup_key(&self) -> (Option<u64>, Option<String>, Option<String>, Option<String>) {
        (
            self.taxon_key,
            self.decimal_latitude.map(|v| format!("{v:.6}")),
            self.decimal_longitude.map(|v| format!("{v:.6}")),
            self.event_date.clone(),
        )
    }
}

/// Occurrence record enriched with Natura 2000 site attributes by the
/// spatial join. Site fields are null for points outside every site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinedRow {
    #[serde(rename = "taxonKey", deserialize_with = "lenient_u64", default)]
    pub taxon_key: Option<u64>,
    #[serde(rename = "scientificName", deserialize_with = "lenient_string", default)]
    pub scientific_name: Option<String>,
    #[serde(rename = "decimalLatitude", deserialize_with = "lenient_f64", default)]
    pub decimal_latitude: Option<f64>,
    #[serde(rename = "decimalLongitude", deserialize_with = "lenient_f64", default)]
    pub decimal_longitude: Option<f64>,
    #[serde(rename = "countryCode", deserialize_with = "lenient_string", default)]
    pub country_code: Option<String>,
    #[serde(rename = "basisOfRecord", deserialize_with = "lenient_string", default)]
    pub basis_of_record: Option<String>,
    #[serde(
        rename = "coordinateUncertaintyInMeters",
        deserialize_with = "lenient_f64",
        default
    )]
    pub coordinate_uncertainty_m: Option<f64>,
    #[serde(rename = "year", deserialize_with = "lenient_i32", default)]
    pub year: Option<i32>,
    #[serde(rename = "eventDate", deserialize_with = "lenient_string", default)]
    pub event_date: Option<String>,
    #[serde(rename = "siteCode", deserialize_with = "lenient_string", default)]
    pub site_code: Option<String>,
    #[serde(rename = "siteName", deserialize_with = "lenient_string", default)]
    pub site_name: Option<String>,
    #[serde(rename = "memberState", deserialize_with = "lenient_string", default)]
    pub member_state: Option<String>,
    #[serde(rename = "siteType", deserialize_with = "lenient_string", default)]
    pub site_type: Option<String>,
}

impl JoinedRow {
    pub fn from_occurrence(row: &OccurrenceRow) -> Self {
        Self {
            taxon_key: row.taxon_key,
            scientific_name: row.scientific_name.clone(),
            decimal_latitude: row.decimal_latitude,
            decimal_longitude: row.decimal_longitude,
            country_code: row.country_code.clone(),
            basis_of_record: row.basis_of_record.clone(),
            coordinate_uncertainty_m: row.coordinate_uncertainty_m,
            year: row.year,
            event_date: row.event_date.clone(),
            site_code: None,
            site_name: None,
            member_state: None,
            site_type: None,
        }
    }

    pub fn observation_date(&self) -> Option<NaiveDate> {
        parse_event_date(self.event_date.as_deref()?)
    }
}

pub fn parse_event_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    // Byte 10 may sit inside a multi-byte character in garbage input;
    // such a value is not a date, not a panic.
    if trimmed.len() < 10 || !trimmed.is_char_boundary(10) {
        return None;
    }
    NaiveDate::parse_from_str(&trimmed[..10], "%Y-%m-%d").ok()
}

fn lenient_string<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let raw = Option::<String>::deserialize(de)?;
    Ok(raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
}

fn lenient_f64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<f64>, D::Error> {
    let raw = Option::<String>::deserialize(de)?;
    Ok(raw.and_then(|s| s.trim().parse::<f64>().ok()))
}

fn lenient_u64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u64>, D::Error> {
    let raw = Option::<String>::deserialize(de)?;
    Ok(raw.and_then(|s| s.trim().parse::<u64>().ok()))
}

fn lenient_i32<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i32>, D::Error> {
    let raw = Option::<String>::deserialize(de)?;
    // Some exports store the year as a float ("1998.0").
    Ok(raw.and_then(|s| {
        let t = s.trim();
        t.parse::<i32>()
            .ok()
            .or_else(|| t.parse::<f64>().ok().map(|v| v as i32))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_date_parsing() {
        assert_eq!(
            parse_event_date("2020-06-01"),
            Some(NaiveDate::from_ymd_opt(2020, 6, 1).unwrap())
        );
        assert_eq!(
            parse_event_date("2020-06-01T12:30:00Z"),
            Some(NaiveDate::from_ymd_opt(2020, 6, 1).unwrap())
        );
        assert_eq!(parse_event_date("2020"), None);
        assert_eq!(parse_event_date("not a date"), None);
    }

    #[test]
    fn event_date_with_multibyte_tenth_byte_is_rejected() {
        // The tenth byte falls inside 'é'; must return None, not panic.
        assert_eq!(parse_event_date("123456789é"), None);
        assert_eq!(parse_event_date("2020-06-0é rest"), None);
        assert_eq!(parse_event_date("čćžšđ"), None);
    }

    #[test]
    fn lenient_numeric_fields() {
        let mut reader = csv::Reader::from_reader(
            "taxonKey,scientificName,decimalLatitude,decimalLongitude,year\n\
             abc,Bubo bubo,45.0,oops,1998.0\n"
                .as_bytes(),
        );
        let row: OccurrenceRow = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(row.taxon_key, None);
        assert_eq!(row.decimal_latitude, Some(45.0));
        assert_eq!(row.decimal_longitude, None);
        assert_eq!(row.year, Some(1998));
    }

    #[test]
    fn empty_strings_become_none() {
        let mut reader = csv::Reader::from_reader(
            "taxonKey,scientificName,basisOfRecord\n123,  ,HUMAN_OBSERVATION\n".as_bytes(),
        );
        let row: OccurrenceRow = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(row.taxon_key, Some(123));
        assert_eq!(row.scientific_name, None);
        assert_eq!(row.basis_of_record.as_deref(), Some("HUMAN_OBSERVATION"));
    }
}
