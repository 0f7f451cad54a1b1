//! Prompt assembly for queue items.
//!
//! Prompt wording is deliberately plain; the structure (which sections exist and
//! which data flows into them) is what the processor relies on.

use crate::store::{DataType, EntityRef, HumanEntity, PendingValidation, PersonaEntity};

/// A ready-to-send model request.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub history: Vec<crate::store::Message>,
}

/// System prompt for a persona speaking to the human.
pub fn persona_system(persona: &PersonaEntity, human: &HumanEntity) -> String {
    let mut sections = vec![identity(persona)];
    if !persona.traits.is_empty() || !persona.topics.is_empty() {
        sections.push(persona_profile(persona));
    }
    if let Some(known) = human_profile(human) {
        sections.push(known);
    }
    sections.push(
        "# Instructions\n\nReply as yourself, in your own voice. Do not repeat the human's message back.".to_string(),
    );
    sections.join("\n\n")
}

fn identity(persona: &PersonaEntity) -> String {
    let mut out = format!("# {}\n\nYou are {}.", persona.display_name(), persona.display_name());
    if persona.aliases.len() > 1 {
        out.push_str(&format!(" You also answer to {}.", persona.aliases[1..].join(", ")));
    }
    if !persona.short_description.is_empty() {
        out.push_str(&format!(" {}", persona.short_description));
    }
    if !persona.long_description.is_empty() {
        out.push_str(&format!("\n\n{}", persona.long_description));
    }
    out
}

fn persona_profile(persona: &PersonaEntity) -> String {
    let mut out = String::from("# Your personality");
    for t in &persona.traits {
        out.push_str(&format!("\n- {}: {}", t.name, t.description));
    }
    if !persona.topics.is_empty() {
        out.push_str("\n\nTopics you care about:");
        for t in &persona.topics {
            out.push_str(&format!("\n- {}", t.name));
        }
    }
    out
}

fn human_profile(human: &HumanEntity) -> Option<String> {
    let mut lines = Vec::new();
    lines.extend(human.facts.iter().map(|f| format!("- {}: {}", f.name, f.description)));
    lines.extend(human.traits.iter().map(|t| format!("- trait {}: {}", t.name, t.description)));
    lines.extend(human.topics.iter().map(|t| format!("- interested in {}", t.name)));
    lines.extend(human.people.iter().map(|p| format!("- knows {} ({})", p.name, p.relationship)));
    if lines.is_empty() {
        None
    } else {
        Some(format!("# What you know about the human\n\n{}", lines.join("\n")))
    }
}

/// User turn for an unprompted check-in.
pub fn heartbeat_user(topic: &str) -> String {
    format!(
        "[The human has been quiet for a while. You have been thinking about \"{}\". \
         Reach out with a short message if it feels natural.]",
        topic
    )
}

/// System prompt for an extraction call.
pub fn extraction_system(target: &EntityRef, data_types: &[DataType]) -> String {
    let subject = match target {
        EntityRef::Human => "the human".to_string(),
        EntityRef::Persona(_) => "the assistant persona".to_string(),
    };
    let kinds: Vec<&str> = data_types.iter().map(DataType::as_str).collect();
    format!(
        "You extract structured knowledge about {} from a conversation.\n\n\
         Return only a JSON array. Each element is an object with \"type\" (one of: {}), \"name\", \
         \"description\", \"sentiment\" (-1.0 to 1.0) and, where relevant, \"confidence\" (0.0 to 1.0), \
         \"strength\", \"level_current\", \"level_ideal\" and \"relationship\". Return [] when nothing applies.",
        subject,
        kinds.join(", ")
    )
}

pub fn extraction_user() -> String {
    "Extract from the conversation above.".to_string()
}

pub fn validation_system() -> String {
    "You double-check uncertain knowledge about the human. Answer only with a JSON object \
     {\"valid\": true|false, \"confidence\": 0.0-1.0}."
        .to_string()
}

pub fn validation_user(validation: &PendingValidation) -> String {
    format!(
        "{} \"{}\": {} (current confidence {:.2})",
        validation.data_type.as_str(),
        validation.item_name,
        validation.description,
        validation.confidence
    )
}

pub fn ceremony_system(persona: &PersonaEntity) -> String {
    format!(
        "{}\n\n# Daily check-in\n\nWalk the human through the items below and ask them to confirm or correct each one.",
        identity(persona)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntityStore, Fact, NewPersona, Topic};

    #[test]
    fn test_persona_system_sections() {
        let mut store = EntityStore::new();
        let persona = store
            .persona_add(NewPersona {
                aliases: vec!["Sage".into(), "S".into()],
                short_description: "A calm mentor.".into(),
                topics: vec![Topic::new("gardening", "")],
                ..Default::default()
            })
            .unwrap();
        let human = HumanEntity {
            facts: vec![Fact::new("Name", "Sam")],
            ..Default::default()
        };

        let system = persona_system(&persona, &human);
        assert!(system.starts_with("# Sage"));
        assert!(system.contains("You also answer to S."));
        assert!(system.contains("- gardening"));
        assert!(system.contains("- Name: Sam"));
    }

    #[test]
    fn test_no_human_section_when_empty() {
        let mut store = EntityStore::new();
        let persona = store.persona_add(NewPersona::named("Sage")).unwrap();
        let system = persona_system(&persona, &HumanEntity::default());
        assert!(!system.contains("What you know"));
    }

    #[test]
    fn test_extraction_system_lists_types() {
        let system = extraction_system(&EntityRef::Human, &[DataType::Topic, DataType::Person]);
        assert!(system.contains("one of: topic, person"));
    }
}
