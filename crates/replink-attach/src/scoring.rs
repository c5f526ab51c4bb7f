//! Heuristic scoring of JVM candidates.
//!
//! The score is the sum of every matching rule's weight. Text rules match
//! case-insensitively against the process descriptor or the target's
//! `sun.java.command`; property rules fire when the property is present and
//! not blank.

use std::collections::BTreeMap;

/// System properties reported by a JVM.
pub type Properties = BTreeMap<String, String>;

/// What a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Human-readable process descriptor (command line without the executable).
    Descriptor,
    /// The `sun.java.command` system property.
    JavaCommand,
    /// Any other system property.
    Property(&'static str),
}

/// How a rule matches its field.
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    Contains(&'static str),
    EndsWith(&'static str),
    /// Every needle must be present.
    ContainsAll(&'static [&'static str]),
    AnyOf(&'static [Matcher]),
    NotBlank,
}

impl Matcher {
    /// `text` is already lowercased for the text matchers.
    fn matches(&self, text: &str) -> bool {
        match self {
            Matcher::Contains(needle) => text.contains(needle),
            Matcher::EndsWith(suffix) => text.ends_with(suffix),
            Matcher::ContainsAll(needles) => needles.iter().all(|n| text.contains(n)),
            Matcher::AnyOf(matchers) => matchers.iter().any(|m| m.matches(text)),
            Matcher::NotBlank => !text.trim().is_empty(),
        }
    }
}

/// One additive scoring rule.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub field: Field,
    pub matcher: Matcher,
    pub weight: i32,
}

const fn rule(field: Field, matcher: Matcher, weight: i32) -> Rule {
    Rule {
        field,
        matcher,
        weight,
    }
}

/// Rules for recognising a Spring Boot application.
pub const SPRING_BOOT_RULES: &[Rule] = &[
    // descriptor
    rule(
        Field::Descriptor,
        Matcher::Contains("org.springframework.boot.loader.jarlauncher"),
        4,
    ),
    rule(
        Field::Descriptor,
        Matcher::Contains("org.springframework.boot.loader.propertieslauncher"),
        4,
    ),
    rule(Field::Descriptor, Matcher::Contains("springapplication"), 3),
    rule(Field::Descriptor, Matcher::Contains("springboot"), 3),
    rule(Field::Descriptor, Matcher::ContainsAll(&["spring", "boot"]), 2),
    rule(Field::Descriptor, Matcher::Contains("org.springframework.boot"), 2),
    rule(
        Field::Descriptor,
        Matcher::AnyOf(&[
            Matcher::Contains("-dspring.profiles"),
            Matcher::Contains("-dspring.application"),
        ]),
        2,
    ),
    rule(
        Field::Descriptor,
        Matcher::AnyOf(&[Matcher::Contains("-jar"), Matcher::EndsWith(".jar")]),
        1,
    ),
    rule(Field::Descriptor, Matcher::Contains("application"), 1),
    // sun.java.command
    rule(Field::JavaCommand, Matcher::Contains("org.springframework.boot"), 5),
    rule(Field::JavaCommand, Matcher::Contains("spring.application"), 2),
    rule(Field::JavaCommand, Matcher::Contains("springbootapplication"), 3),
    rule(
        Field::JavaCommand,
        Matcher::AnyOf(&[
            Matcher::Contains("jarlauncher"),
            Matcher::Contains("propertieslauncher"),
        ]),
        3,
    ),
    // declared application properties
    rule(Field::Property("spring.application.name"), Matcher::NotBlank, 3),
    rule(Field::Property("server.port"), Matcher::NotBlank, 2),
    rule(Field::Property("management.server.port"), Matcher::NotBlank, 1),
];

/// Scores a candidate with `rules`.
pub fn score_with(rules: &[Rule], descriptor: &str, properties: &Properties) -> i32 {
    let descriptor = descriptor.to_lowercase();
    let command = properties
        .get("sun.java.command")
        .map(|c| c.to_lowercase())
        .unwrap_or_default();

    rules
        .iter()
        .filter(|rule| match rule.field {
            Field::Descriptor => rule.matcher.matches(&descriptor),
            Field::JavaCommand => rule.matcher.matches(&command),
            Field::Property(key) => properties
                .get(key)
                .is_some_and(|value| rule.matcher.matches(value)),
        })
        .map(|rule| rule.weight)
        .sum()
}

/// Scores a candidate with [`SPRING_BOOT_RULES`].
pub fn score(descriptor: &str, properties: &Properties) -> i32 {
    score_with(SPRING_BOOT_RULES, descriptor, properties)
}
