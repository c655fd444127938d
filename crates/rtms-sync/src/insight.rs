//! Rule-based one-line summaries attached to newly stored transactions.

use rtms_adapters::{parse_amount, RawItem};

pub const UNREMARKABLE: &str = "평이한 거래";
pub const SEPARATOR: &str = " | ";

/// Summarize a deal against `peak` (the highest comparable price known).
/// Never fails: an unreadable price yields [`UNREMARKABLE`].
pub fn annotate(item: &RawItem, peak: Option<i64>) -> String {
    let Some(amount) = item.amount_value().filter(|a| *a > 0) else {
        return UNREMARKABLE.to_string();
    };

    let mut insights = Vec::new();

    if let Some(peak) = peak.filter(|p| *p > 0) {
        if amount < peak {
            let drop_pct = ((peak - amount) as f64 / peak as f64 * 100.0).round() as i64;
            insights.push(format!("📉 전고점 대비 -{drop_pct}% 수준"));
        } else {
            insights.push("🔥 신고가 경신!".to_string());
        }
    }

    if let Some(jeonse) = item.jeonse_amount.as_deref().and_then(parse_amount) {
        let ratio = (jeonse as f64 / amount as f64 * 100.0).round() as i64;
        insights.push(format!(
            "💰 전세가율 {ratio}% (갭 {}만원)",
            group_thousands(amount - jeonse)
        ));
    }

    if insights.is_empty() {
        UNREMARKABLE.to_string()
    } else {
        insights.join(SEPARATOR)
    }
}

fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deal(amount: &str) -> RawItem {
        RawItem {
            apt_name: "잠실 엘스".into(),
            amount: amount.into(),
            area: "84.88".into(),
            floor: "15".into(),
            ..RawItem::default()
        }
    }

    #[test]
    fn below_peak_reports_drop_percentage() {
        assert_eq!(annotate(&deal("125000"), Some(150000)), "📉 전고점 대비 -17% 수준");
    }

    #[test]
    fn at_or_above_peak_is_a_new_high() {
        assert_eq!(annotate(&deal("150000"), Some(150000)), "🔥 신고가 경신!");
        assert_eq!(annotate(&deal("180,000"), Some(150000)), "🔥 신고가 경신!");
    }

    #[test]
    fn jeonse_ratio_is_appended_with_separator() {
        let item = RawItem {
            jeonse_amount: Some("95,000".into()),
            ..deal("125000")
        };
        assert_eq!(
            annotate(&item, Some(150000)),
            "📉 전고점 대비 -17% 수준 | 💰 전세가율 76% (갭 30,000만원)"
        );
    }

    #[test]
    fn no_applicable_rule_or_bad_numbers_are_unremarkable() {
        assert_eq!(annotate(&deal("125000"), None), UNREMARKABLE);
        assert_eq!(annotate(&deal("not-a-price"), Some(150000)), UNREMARKABLE);
        assert_eq!(annotate(&deal(""), Some(150000)), UNREMARKABLE);
        let bad_jeonse = RawItem {
            jeonse_amount: Some("n/a".into()),
            ..deal("125000")
        };
        assert_eq!(annotate(&bad_jeonse, None), UNREMARKABLE);
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
        assert_eq!(group_thousands(-45000), "-45,000");
    }
}
