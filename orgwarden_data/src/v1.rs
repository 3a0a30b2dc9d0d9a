use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Expected value of the `apiVersion` field of every document.
pub static API_VERSION: &str = "v1";

/// Name of the synthetic team granting read access to the whole
/// organization when `everyone_team_enabled` is set.
pub static EVERYONE_TEAM: &str = "everyone";

/// Suffix of the synthetic sibling team holding only a team's owners.
pub static OWNERS_SUFFIX: &str = "-owners";

/// Extra fields found in a document but not part of the schema. They are
/// surfaced as warnings by the loader instead of being hard errors, so a
/// newer repository layout keeps loading on an older binary.
pub type UnknownFields = BTreeMap<String, serde_yaml::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub spec: UserSpec,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSpec {
    #[serde(rename = "githubID")]
    pub github_id: String,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: UnknownFields,
}

impl User {
    pub fn new(name: &str, github_id: &str) -> Self {
        User {
            api_version: API_VERSION.to_string(),
            kind: "User".to_string(),
            name: name.to_string(),
            spec: UserSpec {
                github_id: github_id.to_string(),
                unknown: UnknownFields::new(),
            },
            unknown: UnknownFields::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub spec: TeamSpec,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSpec {
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_team: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: UnknownFields,
}

impl Team {
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    pub fn owners_slug(&self) -> String {
        format!("{}{}", self.slug(), OWNERS_SUFFIX)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[serde(alias = "PRIVATE")]
    Private,
    #[serde(alias = "PUBLIC")]
    Public,
    #[serde(alias = "INTERNAL")]
    Internal,
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Private
    }
}

impl Visibility {
    /// How the visibility maps onto the forge's boolean `private` flag.
    /// Internal repositories are private from the point of view of the
    /// wider world.
    pub fn is_private(self) -> bool {
        !matches!(self, Visibility::Public)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub spec: RepositorySpec,
    /// Name of the team owning the repository, derived from the directory
    /// the document lives in. `None` for orphans found under `archived/`.
    #[serde(skip)]
    pub owner: Option<String>,
    /// Set when the document was found under `archived/`.
    #[serde(skip)]
    pub archived: bool,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub writers: Vec<String>,
    #[serde(default)]
    pub readers: Vec<String>,
    #[serde(default)]
    pub external_user_writers: Vec<String>,
    #[serde(default)]
    pub external_user_readers: Vec<String>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: UnknownFields,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enforcement {
    Disabled,
    Evaluate,
    Active,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassMode {
    Always,
    PullRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassApp {
    pub app_name: String,
    pub mode: BypassMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetConditions {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Parameters attached to a single rule. The forge only honors the fields
/// matching the rule's type; the rest stay at their defaults and are
/// ignored on both sides of the diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleParameters {
    #[serde(default)]
    pub required_approving_review_count: u32,
    #[serde(default)]
    pub dismiss_stale_reviews_on_push: bool,
    #[serde(default)]
    pub require_code_owner_review: bool,
    #[serde(default)]
    pub required_status_checks: Vec<String>,
    #[serde(default)]
    pub strict_required_status_checks_policy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(default)]
    pub parameters: RuleParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ruleset {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub spec: RulesetSpec,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesetSpec {
    pub enforcement: Enforcement,
    #[serde(default)]
    pub bypass_apps: Vec<BypassApp>,
    #[serde(default)]
    pub conditions: RulesetConditions,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: UnknownFields,
}

/// Top-level configuration of the teams repository (`orgwarden.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_admin_team")]
    pub admin_team: String,
    #[serde(default)]
    pub everyone_team_enabled: bool,
    #[serde(default)]
    pub rulesets: Vec<RulesetReference>,
    #[serde(default = "default_max_changesets")]
    pub max_changesets: usize,
    #[serde(default)]
    pub destructive_operations: DestructiveOperations,
    #[serde(default)]
    pub usersync: UserSyncConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        RepositoryConfig {
            admin_team: default_admin_team(),
            everyone_team_enabled: false,
            rulesets: Vec::new(),
            max_changesets: default_max_changesets(),
            destructive_operations: DestructiveOperations::default(),
            usersync: UserSyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RulesetReference {
    pub pattern: String,
    pub ruleset: String,
}

/// Gates for the four classes of destructive events. Everything defaults
/// to off: a fresh deployment never deletes anything until an operator
/// opts in explicitly.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DestructiveOperations {
    #[serde(default)]
    pub users: bool,
    #[serde(default)]
    pub teams: bool,
    #[serde(default)]
    pub repositories: bool,
    #[serde(default)]
    pub rulesets: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSyncConfig {
    #[serde(default = "default_usersync_plugin")]
    pub plugin: String,
}

impl Default for UserSyncConfig {
    fn default() -> Self {
        UserSyncConfig {
            plugin: default_usersync_plugin(),
        }
    }
}

fn default_admin_team() -> String {
    "admin".to_string()
}

fn default_max_changesets() -> usize {
    50
}

fn default_usersync_plugin() -> String {
    "noop".to_string()
}

/// The desired state of the organization, as materialized from the teams
/// repository by the loader. Teams and repositories reference each other
/// by name only; lookups go through these maps.
#[derive(Debug, Clone, Default)]
pub struct Organization {
    /// Document name -> user, protected and managed org members together.
    pub users: HashMap<String, User>,
    /// Document name -> external collaborator.
    pub external_users: HashMap<String, User>,
    /// Team name -> team.
    pub teams: HashMap<String, Team>,
    /// Repository name -> repository.
    pub repositories: HashMap<String, Repository>,
    /// Ruleset name -> ruleset.
    pub rulesets: HashMap<String, Ruleset>,
}

/// Derives the canonical ASCII identifier from a display name. Every slug
/// in the system comes from here; callers must not invent their own.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        for folded in fold_ascii(c) {
            if folded.is_ascii_alphanumeric() {
                if pending_dash && !slug.is_empty() {
                    slug.push('-');
                }
                pending_dash = false;
                slug.push(folded.to_ascii_lowercase());
            } else {
                pending_dash = true;
            }
        }
    }
    slug
}

/// Maps a single character onto its unaccented ASCII spelling. Characters
/// without a mapping are passed through and end up replaced by `-` in
/// `slugify` if they are not ASCII alphanumeric.
fn fold_ascii(c: char) -> impl Iterator<Item = char> {
    let folded: &[char] = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => &['a'],
        'ç' | 'Ç' => &['c'],
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => &['e'],
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => &['i'],
        'ñ' | 'Ñ' => &['n'],
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => &['o'],
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => &['u'],
        'ý' | 'ÿ' | 'Ý' => &['y'],
        'æ' | 'Æ' => &['a', 'e'],
        'œ' | 'Œ' => &['o', 'e'],
        'ß' => &['s', 's'],
        _ => return Fold::Keep(Some(c)),
    };
    Fold::Mapped(folded.iter().copied())
}

enum Fold<I> {
    Keep(Option<char>),
    Mapped(I),
}

impl<I: Iterator<Item = char>> Iterator for Fold<I> {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        match self {
            Fold::Keep(c) => c.take(),
            Fold::Mapped(iter) => iter.next(),
        }
    }
}
