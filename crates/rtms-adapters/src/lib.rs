//! Upstream source adapter contracts + the apartment-trade record codec.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use rtms_core::Cell;
use rtms_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "rtms-adapters";

pub const DEFAULT_ENDPOINT: &str =
    "https://apis.data.go.kr/1613000/RTMSDataSvcAptTradeDev/getRTMSDataSvcAptTradeDev";

/// One decoded trade record. Fields keep the upstream text (trimmed, price
/// without thousands separators) so hashing matches what earlier runs stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawItem {
    pub apt_name: String,
    pub district_code: String,
    pub dong: String,
    pub jibun: String,
    pub build_year: String,
    pub deal_year: String,
    pub deal_month: String,
    pub deal_day: String,
    pub floor: String,
    pub area: String,
    pub amount: String,
    pub cancel_date: Option<String>,
    pub road_name: String,
    pub deal_type: String,
    /// Lease deposit for the same unit, when a caller has one to compare against.
    pub jeonse_amount: Option<String>,
}

impl RawItem {
    /// `YYYY-MM-DD` when month and day are numeric, the raw parts joined otherwise.
    pub fn deal_date(&self) -> String {
        match (self.deal_month.parse::<u32>(), self.deal_day.parse::<u32>()) {
            (Ok(month), Ok(day)) => format!("{}-{:02}-{:02}", self.deal_year, month, day),
            _ => format!("{}-{}-{}", self.deal_year, self.deal_month, self.deal_day),
        }
    }

    pub fn deal_naive_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(
            self.deal_year.parse().ok()?,
            self.deal_month.parse().ok()?,
            self.deal_day.parse().ok()?,
        )
    }

    pub fn amount_value(&self) -> Option<i64> {
        parse_amount(&self.amount)
    }

    pub fn area_value(&self) -> Option<f64> {
        self.area.trim().parse().ok().filter(|v: &f64| v.is_finite())
    }

    pub fn floor_value(&self) -> Option<i64> {
        self.floor.trim().parse().ok()
    }

    pub fn build_year_value(&self) -> Option<i64> {
        self.build_year.trim().parse().ok()
    }

    pub fn content_hash(&self) -> ContentHash {
        hash(self)
    }
}

/// Price in 10k-KRW units; tolerates thousands separators.
pub fn parse_amount(raw: &str) -> Option<i64> {
    raw.trim().replace(',', "").parse().ok()
}

/// Deduplication key of a logical transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex MD5 of `name|floor|area|date|price`; nothing else feeds the digest.
pub fn hash(item: &RawItem) -> ContentHash {
    let raw = format!(
        "{}|{}|{}|{}|{}",
        item.apt_name,
        item.floor,
        item.area,
        item.deal_date(),
        item.amount
    );
    ContentHash(format!("{:x}", md5::compute(raw.as_bytes())))
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("document ended inside <{0}>")]
    Truncated(String),
}

/// Decoded response document: header status, paging totals, and kept items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub result_code: Option<String>,
    pub result_msg: Option<String>,
    pub total_count: Option<usize>,
    pub items: Vec<RawItem>,
}

impl Envelope {
    pub fn is_success(&self) -> bool {
        matches!(self.result_code.as_deref(), Some("00" | "000"))
    }
}

/// Items of a response; a malformed document yields none.
pub fn decode(payload: &[u8]) -> Vec<RawItem> {
    match decode_envelope(payload) {
        Ok(envelope) => envelope.items,
        Err(err) => {
            warn!(error = %err, bytes = payload.len(), "discarding malformed payload");
            Vec::new()
        }
    }
}

pub fn decode_envelope(payload: &[u8]) -> Result<Envelope, DecodeError> {
    let mut reader = Reader::from_reader(payload);
    reader.config_mut().trim_text(true);

    let mut envelope = Envelope::default();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<HashMap<String, String>> = None;
    let mut buf = Vec::new();

    loop {
        let text = match reader.read_event_into(&mut buf)? {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                if name == "item" {
                    current = Some(HashMap::new());
                }
                stack.push(name);
                None
            }
            Event::End(_) => {
                if stack.pop().as_deref() == Some("item") {
                    if let Some(fields) = current.take() {
                        if let Some(item) = item_from_fields(&fields) {
                            envelope.items.push(item);
                        }
                    }
                }
                None
            }
            Event::Text(text) => Some(text.unescape()?.into_owned()),
            Event::CData(data) => Some(String::from_utf8_lossy(&data.into_inner()).into_owned()),
            Event::Eof => break,
            _ => None,
        };
        buf.clear();

        let Some(text) = text else {
            continue;
        };
        let Some(tag) = stack.last() else {
            continue;
        };
        let in_item = stack.len() >= 2 && stack[stack.len() - 2] == "item";
        match (&mut current, in_item) {
            (Some(fields), true) => {
                fields.insert(tag.clone(), text);
            }
            _ => apply_header_field(&mut envelope, tag, text),
        }
    }

    if let Some(open) = stack.pop() {
        return Err(DecodeError::Truncated(open));
    }
    Ok(envelope)
}

fn apply_header_field(envelope: &mut Envelope, tag: &str, text: String) {
    match tag {
        "resultCode" | "returnReasonCode" => envelope.result_code = Some(text.trim().to_string()),
        "resultMsg" | "returnAuthMsg" => envelope.result_msg = Some(text.trim().to_string()),
        "totalCount" => envelope.total_count = text.trim().parse().ok(),
        _ => {}
    }
}

fn item_from_fields(fields: &HashMap<String, String>) -> Option<RawItem> {
    let get = |tag: &str| {
        fields
            .get(tag)
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };
    let non_empty = |value: String| if value.is_empty() { None } else { Some(value) };

    let apt_name = get("aptNm");
    let amount = get("dealAmount").replace(',', "");
    if apt_name.is_empty() || amount.is_empty() {
        return None;
    }

    Some(RawItem {
        apt_name,
        district_code: get("sggCd"),
        dong: get("umdNm"),
        jibun: get("jibun"),
        build_year: get("buildYear"),
        deal_year: get("dealYear"),
        deal_month: get("dealMonth"),
        deal_day: get("dealDay"),
        floor: non_empty(get("floor")).unwrap_or_else(|| "0".to_string()),
        area: get("excluUseAr"),
        amount,
        cancel_date: non_empty(get("cdealDay")),
        road_name: get("roadNm"),
        deal_type: get("dealingGbn"),
        jeonse_amount: None,
    })
}

/// A rate-limited upstream that answers one request per cell.
#[async_trait]
pub trait TradeSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Records for the cell, or the terminal cause once retries are spent.
    async fn fetch(&self, cell: &Cell) -> Result<Vec<RawItem>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct MolitSourceConfig {
    pub endpoint: String,
    pub service_key: String,
    pub page_size: u32,
}

impl Default for MolitSourceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            service_key: String::new(),
            page_size: 1000,
        }
    }
}

/// Apartment trade feed of the land ministry's open data portal.
#[derive(Debug)]
pub struct MolitTradeSource {
    http: HttpFetcher,
    config: MolitSourceConfig,
}

impl MolitTradeSource {
    pub fn new(http: HttpFetcher, config: MolitSourceConfig) -> Self {
        Self { http, config }
    }

    fn query_for(&self, cell: &Cell) -> Vec<(&'static str, String)> {
        vec![
            ("serviceKey", self.config.service_key.clone()),
            ("LAWD_CD", cell.region_code.clone()),
            ("DEAL_YMD", cell.period.to_string()),
            ("numOfRows", self.config.page_size.to_string()),
            ("pageNo", "1".to_string()),
        ]
    }
}

#[async_trait]
impl TradeSource for MolitTradeSource {
    fn source_id(&self) -> &'static str {
        "molit-apt-trade"
    }

    async fn fetch(&self, cell: &Cell) -> Result<Vec<RawItem>, FetchError> {
        let response = self
            .http
            .fetch_bytes(&self.config.endpoint, &self.query_for(cell))
            .await?;

        let envelope = match decode_envelope(&response.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(cell = %cell, error = %err, "malformed payload, treating as no data");
                return Ok(Vec::new());
            }
        };

        if !envelope.is_success() {
            warn!(
                cell = %cell,
                code = envelope.result_code.as_deref().unwrap_or("-"),
                msg = envelope.result_msg.as_deref().unwrap_or("-"),
                "upstream reported a non-success result"
            );
        }
        if let Some(total) = envelope.total_count {
            if total > self.config.page_size as usize {
                warn!(
                    cell = %cell,
                    total,
                    page_size = self.config.page_size,
                    "upstream has more rows than one page returns"
                );
            }
        }
        debug!(cell = %cell, items = envelope.items.len(), attempts = response.attempts, "decoded");
        Ok(envelope.items)
    }
}
