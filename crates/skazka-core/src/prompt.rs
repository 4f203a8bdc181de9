//! Prompt assembly for the generation backend
//!
//! Each system instruction pins the output contract its parser depends on:
//! the streaming one demands a `ЗАГОЛОВОК:` title line followed by the
//! `СЮЖЕТ:` body, the single-payload one demands a bare JSON object.

use crate::types::{Scenario, StoryRequest};

/// Fixed system instruction sent with every generation call.
pub const SYSTEM_INSTRUCTION: &str = r#"
Ты — профессиональный детский писатель. Твоя задача — писать добрые, поучительные и увлекательные сказки для детей.
Язык: Русский.
Целевая длина: 600–700 слов.
Тон: Магический, уютный, безопасный.

ВАЖНО: Выводи ответ СТРОГО в следующем формате для возможности потоковой обработки:
ЗАГОЛОВОК: [Тут название сказки]
СЮЖЕТ: [Тут основной текст сказки]
"#;

/// System instruction for the single-payload flavor. Same writer persona,
/// but the output contract is one JSON object instead of the stream markers,
/// matching what the structured-payload parser accepts.
pub const STRUCTURED_SYSTEM_INSTRUCTION: &str = r#"
Ты — профессиональный детский писатель. Твоя задача — писать добрые, поучительные и увлекательные сказки для детей.
Язык: Русский.
Целевая длина: 600–700 слов.
Тон: Магический, уютный, безопасный.

ВАЖНО: Верни ответ ОДНИМ JSON-объектом (и ТОЛЬКО JSON-объектом, без markdown-ограждений) вида:
{"title": "Название сказки", "content": "Полный текст сказки"}
"#;

/// Marker opening the title line.
pub const TITLE_MARKER: &str = "ЗАГОЛОВОК:";
/// Marker opening the story body.
pub const PLOT_MARKER: &str = "СЮЖЕТ:";

/// Sampling temperature for story generation.
pub const TEMPERATURE: f32 = 0.8;

/// Substituted for an empty custom hero field.
pub const DEFAULT_HERO: &str = "Ребенок";
/// Substituted for an empty custom place field.
pub const DEFAULT_PLACE: &str = "Волшебная страна";
/// Substituted for an empty custom event field.
pub const DEFAULT_EVENT: &str = "Неожиданное приключение";

fn field_or<'a>(value: Option<&'a str>, default: &'a str) -> &'a str {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => default,
    }
}

/// Assemble the free-text instructions for one request.
pub fn build_prompt(request: &StoryRequest) -> String {
    let mut details = format!(
        "Напиши сказку для ребенка по имени {}.",
        request.child_name
    );

    if request.scenario == Scenario::Custom {
        let hero = field_or(request.custom_hero.as_deref(), DEFAULT_HERO);
        let place = field_or(request.custom_place.as_deref(), DEFAULT_PLACE);
        let event = field_or(request.custom_event.as_deref(), DEFAULT_EVENT);
        details.push_str(&format!(
            "\nСценарий: Свой собственный.\nГлавный герой: {hero};\nМесто действия: {place};\nГлавное событие: {event}."
        ));
    } else {
        details.push_str(&format!(" Сценарий: {}.", request.scenario));
    }

    if request.interactive {
        details.push_str(" ЭТО ИНТЕРАКТИВНАЯ СКАЗКА. В конце герой должен предложить ребенку выбор.");
    } else {
        details.push_str(" Сказка должна быть законченной и доброй.");
    }

    details
}
