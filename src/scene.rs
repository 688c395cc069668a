//! Rule-based prompt analysis.
//!
//! Every categorical attribute is resolved by the same first-match scan over an
//! ordered `(category, keywords)` table; the first category with a keyword that
//! occurs anywhere in the lowercased prompt wins.

use serde::{Deserialize, Serialize};

pub type KeywordTable<T> = &'static [(T, &'static [&'static str])];

/// First category in `table` order whose keyword list matches `text`.
/// `text` must already be lowercased.
pub fn first_match<T: Copy>(text: &str, table: KeywordTable<T>, default: T) -> T {
    table
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(default)
}

fn first_substring(text: &str, candidates: &'static [&'static str], default: &'static str) -> &'static str {
    candidates
        .iter()
        .copied()
        .find(|c| text.contains(c))
        .unwrap_or(default)
}

macro_rules! labels {
    ($name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

labels!(CameraMovement {
    Pan => "pan",
    Zoom => "zoom",
    Dolly => "dolly",
    Orbit => "orbit",
    Static => "static",
});

labels!(Style {
    Cinematic => "cinematic",
    Documentary => "documentary",
    Animated => "animated",
    Artistic => "artistic",
    Photorealistic => "photorealistic",
});

labels!(Lighting {
    GoldenHour => "golden_hour",
    Night => "night",
    Studio => "studio",
    Natural => "natural",
    Dramatic => "dramatic",
});

labels!(Weather {
    Clear => "clear",
    Cloudy => "cloudy",
    Rainy => "rainy",
    Foggy => "foggy",
    Snowy => "snowy",
});

labels!(TimeOfDay {
    Day => "day",
    Night => "night",
    Dawn => "dawn",
    Dusk => "dusk",
});

labels!(Mood {
    Peaceful => "peaceful",
    Exciting => "exciting",
    Mysterious => "mysterious",
    Dramatic => "dramatic",
    Happy => "happy",
    Neutral => "neutral",
});

pub const CAMERA_TABLE: KeywordTable<CameraMovement> = &[
    (CameraMovement::Pan, &["pan", "panning", "sweep", "sweeping"]),
    (CameraMovement::Zoom, &["zoom", "zooming", "close-up", "closeup"]),
    (CameraMovement::Dolly, &["dolly", "track", "tracking"]),
    (CameraMovement::Orbit, &["orbit", "orbiting", "around", "circling"]),
    (CameraMovement::Static, &["static", "still", "fixed"]),
];

pub const STYLE_TABLE: KeywordTable<Style> = &[
    (Style::Cinematic, &["cinematic", "film", "movie"]),
    (Style::Documentary, &["documentary", "realistic", "real"]),
    (Style::Animated, &["animated", "cartoon", "anime"]),
    (Style::Artistic, &["artistic", "painting", "impressionist"]),
    (Style::Photorealistic, &["photorealistic", "photo", "realistic"]),
];

pub const LIGHTING_TABLE: KeywordTable<Lighting> = &[
    (Lighting::GoldenHour, &["golden hour", "sunset", "sunrise", "dusk", "dawn"]),
    (Lighting::Night, &["night", "dark", "moonlight"]),
    (Lighting::Studio, &["studio", "professional lighting"]),
    (Lighting::Natural, &["natural", "daylight", "sunlight"]),
    (Lighting::Dramatic, &["dramatic", "high contrast", "moody"]),
];

pub const WEATHER_TABLE: KeywordTable<Weather> = &[
    (Weather::Clear, &["clear", "sunny"]),
    (Weather::Cloudy, &["cloudy", "overcast"]),
    (Weather::Rainy, &["rain", "rainy", "storm"]),
    (Weather::Foggy, &["fog", "foggy", "mist"]),
    (Weather::Snowy, &["snow", "snowy", "winter"]),
];

pub const TIME_TABLE: KeywordTable<TimeOfDay> = &[
    (TimeOfDay::Day, &["day", "daytime", "afternoon"]),
    (TimeOfDay::Night, &["night", "nighttime", "evening"]),
    (TimeOfDay::Dawn, &["dawn", "sunrise", "early morning"]),
    (TimeOfDay::Dusk, &["dusk", "sunset", "twilight"]),
];

pub const MOOD_TABLE: KeywordTable<Mood> = &[
    (Mood::Peaceful, &["peaceful", "calm", "serene", "tranquil"]),
    (Mood::Exciting, &["exciting", "dynamic", "energetic", "fast"]),
    (Mood::Mysterious, &["mysterious", "dark", "unknown", "eerie"]),
    (Mood::Dramatic, &["dramatic", "intense", "powerful"]),
    (Mood::Happy, &["happy", "cheerful", "bright", "joyful"]),
];

pub const ACTION_VERBS: &[&str] = &[
    "flying", "walking", "running", "rotating", "spinning", "exploding", "growing", "shrinking",
    "moving", "flowing", "crashing", "blooming", "dividing", "dancing", "falling",
];

// No "ocean"/"beach": seascapes resolve to the generic setting.
pub const LOCATIONS: &[&str] = &[
    "city", "forest", "space", "lab", "street", "room", "sky", "underwater", "desert", "mountain",
];

pub const DEFAULT_ACTION: &str = "existing";
pub const DEFAULT_SETTING: &str = "generic";

const QUALITY_SUFFIX: &str =
    ", highly detailed, 8k resolution, professional photography, sharp focus, vivid colors, masterpiece";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneDescription {
    pub raw_prompt: String,
    pub subject: String,
    pub action: &'static str,
    pub setting: &'static str,
    pub style: Style,
    pub camera_movement: CameraMovement,
    pub lighting: Lighting,
    pub weather: Weather,
    pub time_of_day: TimeOfDay,
    pub mood: Mood,
    pub duration_seconds: u32,
}

impl SceneDescription {
    /// Copy of the scene with an explicit style.
    pub fn with_style(&self, style: Style) -> Self {
        Self { style, ..self.clone() }
    }
}

pub fn analyze(prompt: &str, duration: u32) -> SceneDescription {
    let lower = prompt.to_lowercase();
    SceneDescription {
        raw_prompt: prompt.to_string(),
        subject: prompt.split_whitespace().take(3).collect::<Vec<_>>().join(" "),
        action: first_substring(&lower, ACTION_VERBS, DEFAULT_ACTION),
        setting: first_substring(&lower, LOCATIONS, DEFAULT_SETTING),
        style: first_match(&lower, STYLE_TABLE, Style::Photorealistic),
        camera_movement: first_match(&lower, CAMERA_TABLE, CameraMovement::Static),
        lighting: first_match(&lower, LIGHTING_TABLE, Lighting::Natural),
        weather: first_match(&lower, WEATHER_TABLE, Weather::Clear),
        time_of_day: first_match(&lower, TIME_TABLE, TimeOfDay::Day),
        mood: first_match(&lower, MOOD_TABLE, Mood::Neutral),
        duration_seconds: duration,
    }
}

pub fn create_enhanced_prompt(scene: &SceneDescription) -> String {
    let prefix = match scene.style {
        Style::Cinematic => "Cinematic shot, ",
        Style::Documentary => "Documentary footage, ",
        Style::Animated => "Beautiful animation, ",
        Style::Artistic => "Artistic rendering, ",
        Style::Photorealistic => "Photorealistic, ",
    };
    let lighting = match scene.lighting {
        Lighting::GoldenHour => " during golden hour lighting",
        Lighting::Night => " at night with dramatic lighting",
        Lighting::Studio => " with professional studio lighting",
        Lighting::Natural => " with natural lighting",
        Lighting::Dramatic => " with dramatic high-contrast lighting",
    };
    format!("{prefix}{}{lighting}{QUALITY_SUFFIX}", scene.raw_prompt)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenePlan {
    pub scene_number: u32,
    pub start_time: u32,
    pub end_time: u32,
    pub description: String,
    pub camera_movement: CameraMovement,
    pub style: Style,
}

/// Splits a long request into consecutive `scene_duration`-second scenes.
pub fn split_into_scenes(scene: &SceneDescription, scene_duration: u32) -> Vec<ScenePlan> {
    let scene_duration = scene_duration.max(1);
    let total = scene.duration_seconds;
    let count = (total / scene_duration).max(1);
    (0..count)
        .map(|i| ScenePlan {
            scene_number: i,
            start_time: i * scene_duration,
            end_time: ((i + 1) * scene_duration).min(total),
            description: scene.raw_prompt.clone(),
            camera_movement: scene.camera_movement,
            style: scene.style,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ocean_scenario() {
        let scene = analyze("Ocean waves crashing on a beach at golden hour", 10);
        assert_eq!(scene.lighting, Lighting::GoldenHour);
        assert_eq!(scene.setting, "generic");
        assert_eq!(scene.weather, Weather::Clear);
        assert_eq!(scene.action, "crashing");
        assert_eq!(scene.subject, "Ocean waves crashing");
        assert_eq!(scene.time_of_day, TimeOfDay::Day);
        assert_eq!(scene.mood, Mood::Neutral);
        assert_eq!(scene.duration_seconds, 10);
    }

    #[test]
    fn defaults_when_nothing_matches() {
        let scene = analyze("zzz qqq", 5);
        assert_eq!(scene.action, DEFAULT_ACTION);
        assert_eq!(scene.setting, DEFAULT_SETTING);
        assert_eq!(scene.style, Style::Photorealistic);
        assert_eq!(scene.camera_movement, CameraMovement::Static);
        assert_eq!(scene.lighting, Lighting::Natural);
        assert_eq!(scene.weather, Weather::Clear);
        assert_eq!(scene.time_of_day, TimeOfDay::Day);
        assert_eq!(scene.mood, Mood::Neutral);
        assert_eq!(scene.subject, "zzz qqq");
    }

    #[test]
    fn table_order_decides_ties() {
        // "realistic" sits in both documentary and photorealistic; documentary is listed first.
        assert_eq!(analyze("a realistic cat", 5).style, Style::Documentary);
        // "dark" is both a night lighting and a mysterious mood keyword.
        let scene = analyze("A DARK forest with a drone orbiting", 5);
        assert_eq!(scene.lighting, Lighting::Night);
        assert_eq!(scene.mood, Mood::Mysterious);
        assert_eq!(scene.setting, "forest");
        assert_eq!(scene.camera_movement, CameraMovement::Orbit);
    }

    #[test]
    fn generic_matcher_returns_default() {
        const TABLE: KeywordTable<u8> = &[(1, &["a"]), (2, &["b"])];
        assert_eq!(first_match("xbx", TABLE, 0), 2);
        assert_eq!(first_match("ab", TABLE, 0), 1);
        assert_eq!(first_match("zzz", TABLE, 0), 0);
    }

    #[test]
    fn enhanced_prompt_composition() {
        let scene = analyze("Cinematic city at sunset", 10);
        assert_eq!(
            create_enhanced_prompt(&scene),
            "Cinematic shot, Cinematic city at sunset during golden hour lighting, highly detailed, \
             8k resolution, professional photography, sharp focus, vivid colors, masterpiece"
        );
        let anim = scene.with_style(Style::Animated);
        assert!(create_enhanced_prompt(&anim).starts_with("Beautiful animation, "));
        assert_eq!(scene.style, Style::Cinematic);
    }

    #[test]
    fn labels_serialize_as_snake_case() {
        assert_eq!(serde_json::to_string(&Lighting::GoldenHour).unwrap(), "\"golden_hour\"");
        assert_eq!(Lighting::GoldenHour.to_string(), "golden_hour");
    }

    #[test]
    fn scene_split() {
        let scene = analyze("Birds flying over a mountain", 12);
        let plans = split_into_scenes(&scene, 5);
        assert_eq!(plans.len(), 2);
        assert_eq!((plans[1].start_time, plans[1].end_time), (5, 10));
        assert_eq!(split_into_scenes(&analyze("short clip here", 3), 5).len(), 1);
    }
}
