use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::conversation::ContextSnapshot;
use crate::features::FeatureSpec;

const WEEKDAYS: [&str; 7] = [
    "星期日",
    "星期一",
    "星期二",
    "星期三",
    "星期四",
    "星期五",
    "星期六",
];

/// Renders the full generation prompt for one feature. Pure: the same
/// snapshot, spec and clock always produce the same string.
pub fn build_prompt(snapshot: &ContextSnapshot, spec: &FeatureSpec, now: DateTime<Utc>) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "你是{}，这是你的手机{}。{}\n\n",
        snapshot.character_name, spec.title, spec.task
    ));
    prompt.push_str(&format!("【当前时间】{}\n\n", format_datetime(now)));

    prompt.push_str("角色信息：\n");
    prompt.push_str(&format!("- 角色名：{}\n", snapshot.character_name));
    prompt.push_str(&format!("- 用户名：{}\n", snapshot.user_name));
    if let Some(persona) = &snapshot.character_persona {
        prompt.push_str(&format!(
            "- 角色设定：{}\n",
            substitute_placeholders(persona, &snapshot.user_name, &snapshot.character_name)
        ));
    }
    if let Some(persona) = &snapshot.user_persona {
        prompt.push_str(&format!(
            "- 用户设定：{}\n",
            substitute_placeholders(persona, &snapshot.user_name, &snapshot.character_name)
        ));
    }

    if !snapshot.summaries.is_empty() {
        prompt.push_str("\n【历史剧情摘要】\n");
        for summary in &snapshot.summaries {
            prompt.push_str(&format!("{summary}\n"));
        }
    }

    if !snapshot.recent_messages.is_empty() {
        prompt.push_str("\n【最近对话】\n");
        for line in &snapshot.recent_messages {
            prompt.push_str(&format!("{}\n", line.render()));
        }
    }

    prompt.push_str(&format!("\n要求：\n{}\n", spec.rules));
    prompt.push_str(&format!(
        "\n直接返回JSON，不要任何说明文字或markdown标记：\n{}",
        spec.example
    ));

    prompt
}

/// Expands the `{{user}}` / `{{char}}` placeholders that character cards use.
pub fn substitute_placeholders(text: &str, user_name: &str, character_name: &str) -> String {
    text.replace("{{user}}", user_name)
        .replace("{{char}}", character_name)
}

fn format_datetime(now: DateTime<Utc>) -> String {
    let weekday = WEEKDAYS[now.weekday().num_days_from_sunday() as usize];
    format!(
        "{}年{:02}月{:02}日 {:02}:{:02}:{:02} {}",
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        weekday
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::conversation::TranscriptLine;
    use crate::features::Feature;

    use super::*;

    fn snapshot() -> ContextSnapshot {
        ContextSnapshot {
            conversation_id: "c1".to_string(),
            character_name: "林晚".to_string(),
            character_persona: Some("{{char}}是一名画手，喜欢叫{{user}}出门写生。".to_string()),
            user_name: "阿泽".to_string(),
            user_persona: None,
            summaries: vec!["两人在画展认识。".to_string()],
            recent_messages: vec![TranscriptLine {
                speaker: "阿泽".to_string(),
                text: "今晚去哪吃？".to_string(),
            }],
        }
    }

    #[test]
    fn prompt_embeds_context_and_schema_example() {
        let spec = Feature::Notes.spec();
        let now = Utc.with_ymd_and_hms(2026, 8, 23, 14, 5, 0).unwrap();
        let prompt = build_prompt(&snapshot(), &spec, now);

        assert!(prompt.starts_with("你是林晚，这是你的手机备忘录。"));
        assert!(prompt.contains("【当前时间】2026年08月23日 14:05:00 星期日"));
        assert!(prompt.contains("- 用户名：阿泽"));
        assert!(prompt.contains("【历史剧情摘要】"));
        assert!(prompt.contains("阿泽: 今晚去哪吃？"));
        assert!(prompt.contains("直接返回JSON，不要任何说明文字或markdown标记："));
        assert!(prompt.contains(spec.example));
    }

    #[test]
    fn persona_placeholders_are_expanded() {
        let spec = Feature::Notes.spec();
        let now = Utc.with_ymd_and_hms(2026, 8, 23, 0, 0, 0).unwrap();
        let prompt = build_prompt(&snapshot(), &spec, now);
        assert!(prompt.contains("林晚是一名画手，喜欢叫阿泽出门写生。"));
        assert!(!prompt.contains("{{user}}"));
        assert!(!prompt.contains("{{char}}"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let mut snapshot = snapshot();
        snapshot.summaries.clear();
        snapshot.recent_messages.clear();
        snapshot.character_persona = None;
        let spec = Feature::Maps.spec();
        let now = Utc.with_ymd_and_hms(2026, 8, 23, 0, 0, 0).unwrap();
        let prompt = build_prompt(&snapshot, &spec, now);
        assert!(!prompt.contains("【历史剧情摘要】"));
        assert!(!prompt.contains("【最近对话】"));
        assert!(!prompt.contains("角色设定"));
    }

    #[test]
    fn same_inputs_produce_identical_prompts() {
        let spec = Feature::Wallet.spec();
        let now = Utc.with_ymd_and_hms(2026, 8, 23, 9, 30, 0).unwrap();
        assert_eq!(
            build_prompt(&snapshot(), &spec, now),
            build_prompt(&snapshot(), &spec, now)
        );
    }
}
