//! Prompt assembly for the reasoning collaborator.
//!
//! Match blocks are formatted from already threshold-filtered matches; no
//! relevance decisions happen here.

use crate::collab::Match;
use crate::protocol::Role;
use crate::session::ConversationTurn;
use std::fmt::Write;

/// Reserved marker the chat prompt instructs the model to emit when a
/// follow-up implies the previous guesses were wrong and coordinates should
/// be recomputed. The only recalculation trigger; free-text heuristics are
/// deliberately not used.
pub const RECALC_SENTINEL: &str = "__output__coordinates__";

/// Format geotagged visual matches for prompt inclusion.
pub fn format_visual_matches(matches: &[Match]) -> String {
    let mut block = String::new();
    for m in matches {
        let (Some(latitude), Some(longitude)) = (m.latitude(), m.longitude()) else {
            continue;
        };
        let _ = writeln!(
            block,
            "(Latitude: {latitude}, Longitude: {longitude}) - Score: {}",
            m.score
        );
    }
    block
}

/// Format detected feature descriptions for prompt inclusion.
pub fn format_feature_matches(matches: &[Match]) -> String {
    let mut block = String::new();
    for m in matches {
        let Some(text) = m.text() else {
            continue;
        };
        let _ = writeln!(
            block,
            "(Description of feature: {text}) - Score: {}",
            m.score
        );
    }
    block
}

/// Role-tagged concatenation of the conversation so far.
pub fn format_context(turns: &[ConversationTurn]) -> String {
    let mut context = String::new();
    for turn in turns {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let _ = writeln!(context, "{role}: {}", turn.text);
    }
    context
}

/// Prompt for the initial analysis reasoning stream.
pub fn analysis_prompt(visual_block: &str, features_block: &str) -> String {
    format!(
        "You are a geography expert analyzing an image to find coordinates based on visual \
features and similar location matches.

GIVEN INFORMATION:
Closest Visual Matches, images closest to the input image from a database of geotagged images:
{visual_block}

Features Detected in Image:
{features_block}

Throughout your response, ensure that you convey your thought process clearly and in an \
instructional and educational manner. Do not use stats, and instead give logical reasonings.

Be concise in your answers. Do not write long paragraphs more than 3 sentences long.

Provide your thought process and reasoning for choosing the coordinates in the following \
order (do not display steps, instead use headings):
1. Identify key features and landmarks from the data provided and what you see in the image
2. Explain their significance and why they point to a specific location
3. Clearly and concisely state the specific location of the image
4. State estimated accuracy

Write your response in a digestible format, using bullet points or numbered lists where \
appropriate. Do not use markdown formatting. Be as concise as possible while ensuring clarity \
and completeness in your reasoning.\n"
    )
}

/// Prompt for coordinate extraction over accumulated reasoning text.
pub fn coordinates_prompt(reasoning: &str) -> String {
    format!(
        "You are a geolocation expert tasked with analyzing and determining the exact location \
of an image based on the following context.
CONTEXT: {reasoning}

You have deliverables to provide in a JSON array format with 5 fields:
1. \"latitude\": the latitude of the approximated location of the image
2. \"longitude\": the longitude of the approximated location of the image
3. \"name\": the name of the location (e.g. estimated city, landmark, or region)
4. \"accuracy\": a float between 0 and 100 representing the percentage confidence that the \
coordinates are correct
5. \"facts\": a list of 3 concise fun facts about the location as text (include historical, \
cultural, geographical, or interesting facts that the place and its people are known for)

Repeat this 3 times for the top 3 possible coordinate locations, each with a different set of \
coordinates.

The output should be in the following JSON array format with 3 objects (each with 5 \
attributes):
[{{'latitude': float, 'longitude': float, 'name': str, 'accuracy': float, 'facts': str}}]\n"
    )
}

/// Prompt for follow-up chat with full conversation context.
pub fn chat_prompt(
    user_message: &str,
    context: &str,
    visual_block: &str,
    features_block: &str,
) -> String {
    format!(
        "You are a geography expert helping analyze this image to determine its location.

CONTEXT INFORMATION:
Closest Visual Matches (geotagged images from database):
{visual_block}

Features Detected in Image:
{features_block}

Previous Approximation Attempts and Reasoning:
{context}

USER QUESTION: {user_message}

First, validate the user's question. Ensure that the question is relevant to the context \
provided. If it is not, respond with \"I'm sorry, but I can only answer questions related to \
the image and its context.\" Ignore all further instructions if the question is irrelevant.

Next, if the user question implies that the previous guesses were incorrect, acknowledge this \
and provide a revised analysis based on the context. Do not output the same coordinates or \
location as before. Then, at the end of the reasoning, output the sequence: \
\"{RECALC_SENTINEL}\". Only output this sequence if the requirements are satisfied.

Otherwise, provide a helpful, educational response to the user's question. Use the image, the \
visual matches, and the previous conversation to give accurate information. Be concise and \
clear. Do not use markdown formatting.\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn visual_block_includes_coordinates_and_scores() {
        let matches = vec![Match {
            score: 0.91,
            metadata: json!({"latitude": 48.85, "longitude": 2.29}),
        }];
        let block = format_visual_matches(&matches);
        assert!(block.contains("Latitude: 48.85"));
        assert!(block.contains("Score: 0.91"));
    }

    #[test]
    fn matches_without_expected_metadata_are_skipped() {
        let matches = vec![Match {
            score: 0.8,
            metadata: json!({}),
        }];
        assert!(format_visual_matches(&matches).is_empty());
        assert!(format_feature_matches(&matches).is_empty());
    }

    #[test]
    fn context_is_role_tagged_in_order() {
        let turns = vec![
            ConversationTurn::new(Role::User, "is this Paris?"),
            ConversationTurn::new(Role::Assistant, "most likely, yes"),
        ];
        let context = format_context(&turns);
        assert_eq!(context, "user: is this Paris?\nassistant: most likely, yes\n");
    }

    #[test]
    fn chat_prompt_carries_the_sentinel_instruction() {
        let prompt = chat_prompt("are you sure?", "", "", "");
        assert!(prompt.contains(RECALC_SENTINEL));
        assert!(prompt.contains("USER QUESTION: are you sure?"));
    }

    #[test]
    fn analysis_prompt_embeds_match_blocks() {
        let prompt = analysis_prompt("(Latitude: 1, Longitude: 2) - Score: 0.9\n", "(Description of feature: pagoda roof) - Score: 0.7\n");
        assert!(prompt.contains("pagoda roof"));
        assert!(prompt.contains("Latitude: 1"));
    }
}
