//! Site/vendor authorization policy.
//!
//! Grounded on `protocols/http/server/policy.py`. The policy file has one
//! `[roles]` section listing every role name with its comma-separated
//! member list as the option value (the anonymous role's value is
//! empty), plus one section per role named after it, holding an `actions`
//! option with that role's comma-separated allowed actions. An action
//! entry prefixed with `@` inherits another role's actions; a member
//! entry prefixed with `@` is a system group, resolved against the group
//! database.
//!
//! Two bugs in the original are fixed rather than reproduced: action
//! inheritance (`@role`) must actually merge the referenced role's
//! actions into the result (the original computed a set union but
//! discarded it without reassigning), and role lookup by name must not
//! shadow the name being searched for with the loop variable (the
//! original's `role_actions` always compared a role to itself).

use std::collections::HashSet;
use std::path::Path;

use configparser::ini::Ini;
use snafu::{OptionExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to parse policy file {path:?}: {message}"))]
    Parse {
        path: std::path::PathBuf,
        message: String,
    },

    #[snafu(display("policy file {path:?} has no [roles] section"))]
    MissingRolesSection { path: std::path::PathBuf },

    #[snafu(display("role {role} not found in policy"))]
    RoleNotFound { role: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone)]
pub struct PolicyRole {
    pub name: String,
    /// `None` for the anonymous role, which has no membership check.
    pub members: Option<HashSet<String>>,
    pub actions: HashSet<String>,
}

pub struct PolicyManager {
    roles: Vec<PolicyRole>,
}

impl PolicyManager {
    /// Load the site policy if present, otherwise the vendor policy.
    pub fn load(site_policy: &Path, vendor_policy: &Path) -> Result<Self> {
        let path = if site_policy.exists() {
            site_policy
        } else {
            vendor_policy
        };
        Self::load_policy(path)
    }

    fn load_policy(path: &Path) -> Result<Self> {
        let mut ini = Ini::new_cs();
        ini.load(path).map_err(|message| Error::Parse {
            path: path.to_path_buf(),
            message,
        })?;

        let role_names: Vec<String> = ini
            .get_map_ref()
            .get("roles")
            .context(MissingRolesSectionSnafu {
                path: path.to_path_buf(),
            })?
            .keys()
            .cloned()
            .collect();

        let mut roles = Vec::new();
        for name in &role_names {
            let raw_actions = ini.get(name, "actions").unwrap_or_default();
            let members = if name == ANONYMOUS {
                None
            } else {
                let raw_members = ini.get("roles", name).unwrap_or_default();
                Some(expand_members(&raw_members))
            };
            roles.push(PolicyRole {
                name: name.clone(),
                members,
                actions: raw_actions
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            });
        }

        // Expand `@role` action references against the full set gathered
        // above, so forward references (a role declared before the one it
        // references) still resolve.
        let snapshot: Vec<(String, HashSet<String>)> = roles
            .iter()
            .map(|r| (r.name.clone(), r.actions.clone()))
            .collect();
        for role in roles.iter_mut() {
            let references: Vec<String> = role
                .actions
                .iter()
                .filter(|a| a.starts_with('@'))
                .cloned()
                .collect();
            for reference in references {
                role.actions.remove(&reference);
                let target = &reference[1..];
                if let Some((_, actions)) = snapshot.iter().find(|(name, _)| name == target) {
                    role.actions.extend(actions.iter().cloned());
                }
            }
        }

        Ok(PolicyManager { roles })
    }

    /// Actions allowed for `role`, matching by name (never shadowed by
    /// the search loop's own variable).
    pub fn role_actions(&self, role: &str) -> Result<&HashSet<String>> {
        self.roles
            .iter()
            .find(|r| r.name == role)
            .map(|r| &r.actions)
            .context(RoleNotFoundSnafu {
                role: role.to_string(),
            })
    }

    pub fn allow_anonymous(&self) -> bool {
        self.roles.iter().any(|r| r.name == ANONYMOUS)
    }

    fn user_roles(&self, user: &str) -> Vec<&PolicyRole> {
        self.roles
            .iter()
            .filter(|role| match &role.members {
                None => true,
                Some(members) => members.iter().any(|member| {
                    if let Some(group) = member.strip_prefix('@') {
                        group_members(group).contains(user)
                    } else {
                        member == user
                    }
                }),
            })
            .collect()
    }

    pub fn validate_anonymous_action(&self, action: &str) -> bool {
        self.roles
            .iter()
            .any(|role| role.name == ANONYMOUS && role.actions.contains(action))
    }

    pub fn validate_user_action(&self, user: &str, action: &str) -> bool {
        self.user_roles(user)
            .iter()
            .any(|role| role.actions.contains(action))
    }
}

fn expand_members(members_str: &str) -> HashSet<String> {
    members_str
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Resolve a system group's members via `getent`, the way the original
/// used `grp.getgrnam()`.
fn group_members(group: &str) -> HashSet<String> {
    let output = duct::cmd!("getent", "group", group)
        .stdout_capture()
        .unchecked()
        .run();
    let Ok(output) = output else {
        return HashSet::new();
    };
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines()
        .next()
        .and_then(|line| line.split(':').nth(3))
        .map(|members| members.split(',').map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_policy(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn expands_member_list() {
        let members = expand_members("alice, bob ,@admins");
        assert!(members.contains("alice"));
        assert!(members.contains("bob"));
        assert!(members.contains("@admins"));
    }

    #[test]
    fn loads_roles_and_expands_inherited_actions() {
        let file = write_policy(
            "[roles]\n\
             anonymous =\n\
             maintainer = alice,bob\n\
             admin = carol\n\
             \n\
             [anonymous]\n\
             actions = view\n\
             \n\
             [maintainer]\n\
             actions = view,build\n\
             \n\
             [admin]\n\
             actions = @maintainer,manage\n",
        );
        let manager = PolicyManager::load_policy(file.path()).unwrap();
        assert!(manager.allow_anonymous());
        assert!(manager.validate_anonymous_action("view"));
        assert!(!manager.validate_anonymous_action("build"));

        let admin_actions = manager.role_actions("admin").unwrap();
        assert!(admin_actions.contains("build"));
        assert!(admin_actions.contains("view"));
        assert!(admin_actions.contains("manage"));
        assert!(!admin_actions.contains("@maintainer"));

        assert!(manager.validate_user_action("alice", "build"));
        assert!(!manager.validate_user_action("dave", "build"));
    }
}
