use serde_json::Value;

use kindred_contracts::features::Feature;
use kindred_engine::GenerationReport;

/// Renders a generation report for the terminal: a header line naming the
/// screen and where the payload came from, then the feature layout.
pub fn render_report(report: &GenerationReport) -> String {
    let mut out = String::new();
    let source = if report.from_cache { "缓存" } else { "新生成" };
    out.push_str(&format!(
        "== {} ({}) ==\n",
        report.feature.title(),
        source
    ));
    if report.fallback {
        out.push_str("⚠ 生成失败，以下为占位内容，可重新生成。\n");
    }
    if report.truncated {
        out.push_str("⚠ 回复被截断，内容可能不完整。\n");
    }
    out.push_str(&render_feature(report.feature, &report.data));
    out
}

/// Feature payload body, one line per item. Unknown or missing fields render
/// as empty strings rather than failing; the payload already passed shape
/// validation.
pub fn render_feature(feature: Feature, data: &Value) -> String {
    match feature {
        Feature::Maps => render_maps(data),
        Feature::Wallet => render_wallet(data),
        Feature::ScreenTime => render_screen_time(data),
        Feature::CouplesReport => render_couples_report(data),
        _ => render_list(feature, data),
    }
}

fn render_list(feature: Feature, data: &Value) -> String {
    let Some(items) = data.as_array() else {
        return empty_state();
    };
    if items.is_empty() {
        return empty_state();
    }
    let mut out = String::new();
    for item in items {
        out.push_str(&list_line(feature, item));
        out.push('\n');
    }
    out
}

fn list_line(feature: Feature, item: &Value) -> String {
    match feature {
        Feature::Notes => format!("• {}\n  {}", text(item, "title"), text(item, "content")),
        Feature::Mail => format!(
            "• [{}] {} — {}\n  {}",
            text(item, "time"),
            text(item, "sender"),
            text(item, "subject"),
            text(item, "preview")
        ),
        Feature::Messages => format!(
            "• [{}] {}: {}",
            text(item, "time"),
            text(item, "contact"),
            text(item, "preview")
        ),
        Feature::Phone => format!(
            "• [{}] {} ({}) {}",
            text(item, "time"),
            text(item, "contact"),
            text(item, "kind"),
            text(item, "duration")
        ),
        Feature::FictionComments => format!(
            "• {}（{}赞）\n  {}",
            text(item, "username"),
            number(item, "likes"),
            text(item, "content")
        ),
        Feature::MomentsComments => {
            format!("• {}: {}", text(item, "name"), text(item, "content"))
        }
        _ => item.to_string(),
    }
}

fn render_maps(data: &Value) -> String {
    let mut out = String::new();
    if let Some(summary) = data.get("summary") {
        out.push_str(&format!(
            "今日行程：{} / {} / {}个地点\n",
            text(summary, "totalTime"),
            text(summary, "totalDistance"),
            number(summary, "locations")
        ));
    }
    if let Some(timeline) = data.get("timeline").and_then(Value::as_array) {
        for stop in timeline {
            out.push_str(&format!(
                "• {} {}（{}，停留{}分钟）\n",
                text(stop, "time"),
                text(stop, "location"),
                text(stop, "address"),
                number(stop, "duration")
            ));
        }
    }
    if out.is_empty() {
        return empty_state();
    }
    out
}

fn render_wallet(data: &Value) -> String {
    let mut out = String::new();
    if let Some(cards) = data.get("cards").and_then(Value::as_array) {
        for card in cards {
            out.push_str(&format!(
                "卡片：{}（尾号{}） 余额 {}\n",
                text(card, "name"),
                text(card, "tail"),
                text(card, "balance")
            ));
        }
    }
    if let Some(stats) = data.get("stats") {
        out.push_str(&format!(
            "今日支出 {} / 今日收入 {} / 本月支出 {}\n",
            text(stats, "todayExpense"),
            text(stats, "todayIncome"),
            text(stats, "monthExpense")
        ));
    }
    if let Some(transactions) = data.get("transactions").and_then(Value::as_array) {
        for tx in transactions {
            out.push_str(&format!(
                "• [{}] {} {}\n",
                text(tx, "time"),
                text(tx, "title"),
                text(tx, "amount")
            ));
        }
    }
    if out.is_empty() {
        return empty_state();
    }
    out
}

fn render_screen_time(data: &Value) -> String {
    let mut out = String::new();
    if let Some(total) = data.get("totalTime") {
        out.push_str(&format!(
            "今日屏幕时间：{}小时{}分钟\n",
            number(total, "hours"),
            number(total, "minutes")
        ));
    }
    if let Some(apps) = data.get("apps").and_then(Value::as_array) {
        for app in apps {
            out.push_str(&format!(
                "• {} {}小时{}分钟\n",
                text(app, "name"),
                number(app, "hours"),
                number(app, "minutes")
            ));
        }
    }
    if out.is_empty() {
        return empty_state();
    }
    out
}

fn render_couples_report(data: &Value) -> String {
    let mut out = String::new();
    if let Some(closeness) = data.get("closeness").and_then(Value::as_u64) {
        out.push_str(&format!("亲密度：{closeness}\n"));
    }
    let summary = text(data, "summary");
    if !summary.is_empty() {
        out.push_str(&format!("{summary}\n"));
    }
    if let Some(highlights) = data.get("highlights").and_then(Value::as_array) {
        for highlight in highlights {
            out.push_str(&format!("• {}\n", highlight.as_str().unwrap_or_default()));
        }
    }
    if let Some(suggestions) = data.get("suggestions").and_then(Value::as_array) {
        for suggestion in suggestions {
            out.push_str(&format!("建议：{}\n", suggestion.as_str().unwrap_or_default()));
        }
    }
    if out.is_empty() {
        return empty_state();
    }
    out
}

fn empty_state() -> String {
    "（暂无内容）\n".to_string()
}

fn text(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn number(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::String(text)) => text.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn report(feature: Feature, data: Value, fallback: bool, from_cache: bool) -> GenerationReport {
        GenerationReport {
            feature,
            conversation_id: "c1".to_string(),
            data,
            fallback,
            truncated: false,
            from_cache,
            sequence: 1,
        }
    }

    #[test]
    fn notes_render_as_bullets() {
        let data = json!([{"title": "买菜", "content": "西红柿、鸡蛋"}]);
        let rendered = render_feature(Feature::Notes, &data);
        assert!(rendered.contains("• 买菜"));
        assert!(rendered.contains("西红柿、鸡蛋"));
    }

    #[test]
    fn fallback_report_carries_the_placeholder_notice() {
        let rendered = render_report(&report(
            Feature::Notes,
            Feature::Notes.fallback_default(),
            true,
            false,
        ));
        assert!(rendered.contains("占位内容"));
        assert!(rendered.contains("备忘录 1"));
    }

    #[test]
    fn cached_and_fresh_sources_are_distinguished() {
        let data = json!([{"name": "好友", "content": "赞！"}]);
        let fresh = render_report(&report(Feature::MomentsComments, data.clone(), false, false));
        let cached = render_report(&report(Feature::MomentsComments, data, false, true));
        assert!(fresh.contains("新生成"));
        assert!(cached.contains("缓存"));
    }

    #[test]
    fn wallet_layout_includes_cards_stats_and_transactions() {
        let data = json!({
            "cards": [{"name": "储蓄卡", "tail": "6688", "balance": "12580.50"}],
            "transactions": [{"title": "便利店", "amount": "-18.50", "time": "08:12", "category": "food"}],
            "stats": {"todayExpense": "58.50", "todayIncome": "0.00", "monthExpense": "3200.00"},
        });
        let rendered = render_feature(Feature::Wallet, &data);
        assert!(rendered.contains("尾号6688"));
        assert!(rendered.contains("今日支出 58.50"));
        assert!(rendered.contains("便利店 -18.50"));
    }

    #[test]
    fn empty_payloads_render_the_empty_state() {
        assert_eq!(render_feature(Feature::Notes, &json!([])), "（暂无内容）\n");
        assert_eq!(render_feature(Feature::Maps, &json!({})), "（暂无内容）\n");
    }
}
