use crate::github::api::{GithubTeamRepo, RepoPermission};
use crate::github::tests::test_utils::{DataModel, Recorder, RepoData, RulesetData, TeamData};
use crate::github::{Mutation, Reconciler, RemoteSnapshot};
use crate::utils::CancelToken;
use orgwarden_data::v1;
use std::collections::BTreeMap;


fn config() -> v1::RepositoryConfig {
    v1::RepositoryConfig::default()
}

fn destructive_config() -> v1::RepositoryConfig {
    v1::RepositoryConfig {
        destructive_operations: v1::DestructiveOperations {
            users: true,
            teams: true,
            repositories: true,
            rulesets: true,
        },
        ..v1::RepositoryConfig::default()
    }
}

/// A converged model produces an empty plan, whatever it contains.
#[test]
fn converged_model_is_a_noop() {
    let config = v1::RepositoryConfig {
        everyone_team_enabled: true,
        rulesets: vec![v1::RulesetReference {
            pattern: ".*".to_string(),
            ruleset: "base".to_string(),
        }],
        ..v1::RepositoryConfig::default()
    };
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_user("existing.member", "existing_member");
    model.create_external("out.side", "outside_gh");
    model.create_team(
        TeamData::new("existing")
            .owner("existing.owner")
            .member("existing.member"),
    );
    model.create_repo(
        RepoData::new("myrepo")
            .owned_by("existing")
            .external_reader("out.side"),
    );
    model.create_ruleset(RulesetData::new("base").rule("required_signatures"));

    let gh = model.gh_model(&config);
    assert!(model.plan(&config, &gh).is_empty());
}

#[test]
fn new_team() {
    let mut model = DataModel::default();
    model.create_user("new.owner", "new_owner");
    model.create_user("new.member", "new_member");
    model.create_team(TeamData::new("new").owner("new.owner").member("new.member"));

    let plan = model.plan(&config(), &RemoteSnapshot::default());
    insta::assert_debug_snapshot!(plan, @r###"
    [
        AddUserToOrg {
            github_id: "new_member",
        },
        AddUserToOrg {
            github_id: "new_owner",
        },
        CreateTeam {
            slug: "new",
            description: "Managed by the orgwarden teams repository.",
            members: [
                "new_member",
                "new_owner",
            ],
        },
        CreateTeam {
            slug: "new-owners",
            description: "Managed by the orgwarden teams repository.",
            members: [
                "new_owner",
            ],
        },
    ]
    "###);

    let recorder = Recorder::default();
    model
        .reconcile(&config(), &RemoteSnapshot::default(), &recorder)
        .unwrap();
    assert_eq!(recorder.teams_created.borrow()["new"].len(), 2);
    assert_eq!(recorder.teams_created.borrow()["new-owners"].len(), 1);
    assert!(*recorder.committed.borrow());
}

#[test]
fn new_team_with_non_english_slug() {
    let mut model = DataModel::default();
    model.create_user("new.owner", "new_owner");
    model.create_user("new.member", "new_member");
    model.create_team(
        TeamData::new("nouveauté")
            .owner("new.owner")
            .member("new.member"),
    );

    let recorder = Recorder::default();
    model
        .reconcile(&config(), &RemoteSnapshot::default(), &recorder)
        .unwrap();
    assert_eq!(recorder.teams_created.borrow()["nouveaute"].len(), 2);
    assert_eq!(recorder.teams_created.borrow()["nouveaute-owners"].len(), 1);
}

#[test]
fn existing_team_with_new_member() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_user("existing.owner2", "existing_owner2");
    model.create_user("existing.member", "existing_member");
    model.create_team(
        TeamData::new("existing")
            .owner("existing.owner")
            .member("existing.member"),
    );
    let gh = model.gh_model(&config());

    model.get_team("existing").owners.push("existing.owner2".to_string());

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert!(recorder.teams_created.borrow().is_empty());
    assert_eq!(
        recorder.team_member_added.borrow()["existing"],
        vec!["existing_owner2".to_string()]
    );
    assert_eq!(
        recorder.team_member_added.borrow()["existing-owners"],
        vec!["existing_owner2".to_string()]
    );
}

#[test]
fn existing_team_with_removed_member() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_user("existing.member", "existing_member");
    model.create_team(
        TeamData::new("existing")
            .owner("existing.owner")
            .member("existing.member"),
    );
    let gh = model.gh_model(&config());

    model.get_team("existing").members.clear();

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert_eq!(
        recorder.team_member_removed.borrow()["existing"],
        vec!["existing_member".to_string()]
    );
    assert!(!recorder.team_member_removed.borrow().contains_key("existing-owners"));
}

#[test]
fn removed_team_without_destructive_operations() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_team(TeamData::new("existing").owner("existing.owner"));
    model.create_team(TeamData::new("removing").owner("existing.owner"));
    let gh = model.gh_model(&config());

    model.remove_team("removing");

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert!(recorder.teams_deleted.borrow().is_empty());
}

#[test]
fn removed_team() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_team(TeamData::new("existing").owner("existing.owner"));
    model.create_team(TeamData::new("removing").owner("existing.owner"));
    let gh = model.gh_model(&config());

    model.remove_team("removing");

    let recorder = Recorder::default();
    model.reconcile(&destructive_config(), &gh, &recorder).unwrap();
    // both the team and its owners sibling go
    assert_eq!(
        *recorder.teams_deleted.borrow(),
        vec!["removing".to_string(), "removing-owners".to_string()]
    );
}

#[test]
fn everyone_team_is_synthesized() {
    let mut config = config();
    let mut model = DataModel::default();
    model.create_user("new.owner", "new_owner");
    model.create_user("new.member", "new_member");
    model.create_team(TeamData::new("new").owner("new.owner").member("new.member"));
    model.create_repo(RepoData::new("myrepo").owned_by("new"));
    let gh = model.gh_model(&config);

    config.everyone_team_enabled = true;

    let recorder = Recorder::default();
    model.reconcile(&config, &gh, &recorder).unwrap();
    assert_eq!(recorder.teams_created.borrow()["everyone"].len(), 2);
    assert_eq!(
        recorder.repo_team_added.borrow()["myrepo"],
        vec!["everyone".to_string()]
    );
}

#[test]
fn new_repo_with_owner() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_team(TeamData::new("existing").owner("existing.owner"));
    let gh = model.gh_model(&config());

    model.create_repo(RepoData::new("myrepo").owned_by("existing"));

    let plan = model.plan(&config(), &gh);
    insta::assert_debug_snapshot!(plan, @r###"
    [
        CreateRepository {
            repo: "myrepo",
            description: "",
            writers: [
                "existing",
            ],
            readers: [],
            public: false,
        },
    ]
    "###);
}

#[test]
fn new_repo_without_owner_goes_to_the_admin_team() {
    let mut model = DataModel::default();
    let gh = model.gh_model(&config());

    model.create_repo(RepoData::new("orphan"));

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    let created = recorder.repos_created.borrow();
    let (writers, _) = &created["orphan"];
    assert_eq!(writers, &vec!["admin".to_string()]);
}

#[test]
fn permission_change_is_remove_then_add() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_user("existing.member", "existing_member");
    model.create_team(
        TeamData::new("existing")
            .owner("existing.owner")
            .member("existing.member"),
    );
    model.create_repo(RepoData::new("myrepo").owned_by("existing"));
    let mut gh = model.gh_model(&config());

    // the remote granted READ where the model wants WRITE
    gh.team_repos
        .get_mut("existing")
        .unwrap()
        .get_mut("myrepo")
        .unwrap()
        .permission = RepoPermission::Read;

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert!(recorder.repos_created.borrow().is_empty());
    assert!(recorder.repos_deleted.borrow().is_empty());
    assert_eq!(
        recorder.repo_team_removed.borrow()["myrepo"],
        vec!["existing".to_string()]
    );
    assert_eq!(
        recorder.repo_team_added.borrow()["myrepo"],
        vec!["existing".to_string()]
    );
    assert!(recorder.repo_team_updated.borrow().is_empty());
}

#[test]
fn remotely_granted_admin_is_downgraded_to_write() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_team(TeamData::new("existing").owner("existing.owner"));
    model.create_repo(RepoData::new("myrepo").owned_by("existing"));
    let mut gh = model.gh_model(&config());

    // the owner team picked up ADMIN out of band; the model grants WRITE
    gh.team_repos
        .get_mut("existing")
        .unwrap()
        .get_mut("myrepo")
        .unwrap()
        .permission = RepoPermission::Admin;

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert_eq!(
        recorder.repo_team_removed.borrow()["myrepo"],
        vec!["existing".to_string()]
    );
    assert_eq!(
        recorder.repo_team_added.borrow()["myrepo"],
        vec!["existing".to_string()]
    );
    assert!(recorder.repo_team_updated.borrow().is_empty());
}

#[test]
fn add_team_to_existing_repo() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_team(TeamData::new("existing").owner("existing.owner"));
    model.create_team(TeamData::new("reading").owner("existing.owner"));
    model.create_repo(RepoData::new("myrepo").owned_by("existing"));
    let gh = model.gh_model(&config());

    model.get_repo("myrepo").readers.push("reading".to_string());

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert_eq!(
        recorder.repo_team_added.borrow()["myrepo"],
        vec!["reading".to_string()]
    );
    assert!(recorder.repo_team_removed.borrow().is_empty());
}

#[test]
fn remove_team_from_existing_repo_is_not_gated() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_team(TeamData::new("existing").owner("existing.owner"));
    model.create_team(TeamData::new("reading").owner("existing.owner"));
    model.create_repo(
        RepoData::new("myrepo")
            .owned_by("existing")
            .reader("reading"),
    );
    let gh = model.gh_model(&config());

    model.get_repo("myrepo").readers.clear();

    let recorder = Recorder::default();
    // destructive operations stay off: team access removal is an edit
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert_eq!(
        recorder.repo_team_removed.borrow()["myrepo"],
        vec!["reading".to_string()]
    );
}

#[test]
fn archiving_a_repository() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_team(TeamData::new("existing").owner("existing.owner"));
    model.create_repo(RepoData::new("myrepo").owned_by("existing"));
    let gh = model.gh_model(&config());

    model.get_repo("myrepo").archived = true;

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert_eq!(
        *recorder.repos_update_archived.borrow(),
        vec!["myrepo".to_string()]
    );
}

#[test]
fn changing_repository_visibility() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_team(TeamData::new("existing").owner("existing.owner"));
    model.create_repo(RepoData::new("myrepo").owned_by("existing"));
    let gh = model.gh_model(&config());

    model.get_repo("myrepo").visibility = v1::Visibility::Public;

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert_eq!(
        *recorder.repos_update_private.borrow(),
        vec!["myrepo".to_string()]
    );
}

#[test]
fn external_collaborator_downgraded_to_reader() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_external("outside1", "outside1-gh");
    model.create_team(TeamData::new("existing").owner("existing.owner"));
    model.create_repo(
        RepoData::new("myrepo")
            .owned_by("existing")
            .external_reader("outside1"),
    );
    let mut gh = model.gh_model(&config());

    gh.repos
        .get_mut("myrepo")
        .unwrap()
        .external_users
        .insert("outside1-gh".to_string(), RepoPermission::Write);

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert_eq!(
        recorder.external_user_set.borrow()["outside1-gh"],
        RepoPermission::Read
    );
    assert!(recorder.external_user_removed.borrow().is_empty());
}

#[test]
fn external_collaborator_removed() {
    let mut model = DataModel::default();
    model.create_user("existing.owner", "existing_owner");
    model.create_team(TeamData::new("existing").owner("existing.owner"));
    model.create_repo(RepoData::new("myrepo").owned_by("existing"));
    let mut gh = model.gh_model(&config());

    gh.repos
        .get_mut("myrepo")
        .unwrap()
        .external_users
        .insert("stray-gh".to_string(), RepoPermission::Write);

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert!(recorder.external_user_set.borrow().is_empty());
    assert_eq!(
        *recorder.external_user_removed.borrow(),
        vec!["stray-gh".to_string()]
    );
}

#[test]
fn removed_repo_without_destructive_operations() {
    let mut seeded = DataModel::default();
    seeded.create_user("existing.owner", "existing_owner");
    seeded.create_team(TeamData::new("existing").owner("existing.owner"));
    seeded.create_repo(RepoData::new("removing").owned_by("existing"));
    let gh = seeded.gh_model(&config());

    let mut model = seeded.clone();
    model.remove_repo("removing");

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert!(recorder.repos_deleted.borrow().is_empty());

    let recorder = Recorder::default();
    model.reconcile(&destructive_config(), &gh, &recorder).unwrap();
    assert_eq!(*recorder.repos_deleted.borrow(), vec!["removing".to_string()]);
}

#[test]
fn removed_user_is_gated() {
    let mut model = DataModel::default();
    model.create_user("keeping", "keeping_gh");
    model.create_user("leaving", "leaving_gh");
    let gh = model.gh_model(&config());

    model.remove_user("leaving");

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert!(recorder.users_removed.borrow().is_empty());

    let recorder = Recorder::default();
    model.reconcile(&destructive_config(), &gh, &recorder).unwrap();
    assert_eq!(*recorder.users_removed.borrow(), vec!["leaving_gh".to_string()]);
}

#[test]
fn unreferenced_ruleset_is_ignored() {
    let mut model = DataModel::default();
    model.create_ruleset(RulesetData::new("new").rule("required_signatures"));

    let gh = RemoteSnapshot {
        enterprise: true,
        ..Default::default()
    };
    assert!(model.plan(&config(), &gh).is_empty());
}

#[test]
fn referenced_ruleset_is_created() {
    let config = v1::RepositoryConfig {
        rulesets: vec![v1::RulesetReference {
            pattern: ".*".to_string(),
            ruleset: "new".to_string(),
        }],
        ..v1::RepositoryConfig::default()
    };
    let mut model = DataModel::default();
    model.create_ruleset(RulesetData::new("new").rule("required_signatures"));

    let gh = RemoteSnapshot {
        enterprise: true,
        ..Default::default()
    };
    let recorder = Recorder::default();
    model.reconcile(&config, &gh, &recorder).unwrap();
    assert_eq!(*recorder.rulesets_created.borrow(), vec!["new".to_string()]);
    assert!(recorder.rulesets_updated.borrow().is_empty());
    assert!(recorder.rulesets_deleted.borrow().is_empty());
}

#[test]
fn ruleset_enforcement_change_is_a_single_update() {
    let config = v1::RepositoryConfig {
        rulesets: vec![v1::RulesetReference {
            pattern: ".*".to_string(),
            ruleset: "update".to_string(),
        }],
        ..v1::RepositoryConfig::default()
    };
    let mut model = DataModel::default();
    model.create_ruleset(RulesetData::new("update").rule("required_signatures"));
    let mut gh = model.gh_model(&config);

    gh.rulesets.get_mut("update").unwrap().enforcement = v1::Enforcement::Active;

    let recorder = Recorder::default();
    model.reconcile(&config, &gh, &recorder).unwrap();
    assert!(recorder.rulesets_created.borrow().is_empty());
    assert_eq!(*recorder.rulesets_updated.borrow(), vec!["update".to_string()]);
    assert!(recorder.rulesets_deleted.borrow().is_empty());
}

#[test]
fn removed_ruleset_is_gated() {
    let seeded_config = v1::RepositoryConfig {
        rulesets: vec![v1::RulesetReference {
            pattern: ".*".to_string(),
            ruleset: "old".to_string(),
        }],
        ..v1::RepositoryConfig::default()
    };
    let mut model = DataModel::default();
    model.create_ruleset(RulesetData::new("old").rule("required_signatures"));
    let gh = model.gh_model(&seeded_config);

    let recorder = Recorder::default();
    model.reconcile(&config(), &gh, &recorder).unwrap();
    assert!(recorder.rulesets_deleted.borrow().is_empty());

    let recorder = Recorder::default();
    model.reconcile(&destructive_config(), &gh, &recorder).unwrap();
    assert_eq!(*recorder.rulesets_deleted.borrow(), vec![1]);
}

#[test]
fn rulesets_need_the_enterprise_plan() {
    let config = v1::RepositoryConfig {
        rulesets: vec![v1::RulesetReference {
            pattern: ".*".to_string(),
            ruleset: "new".to_string(),
        }],
        ..v1::RepositoryConfig::default()
    };
    let mut model = DataModel::default();
    model.create_ruleset(RulesetData::new("new").rule("required_signatures"));

    assert!(model.plan(&config, &RemoteSnapshot::default()).is_empty());
}

#[test]
fn creations_precede_edits_and_deletions_trail() {
    let mut model = DataModel::default();
    model.create_user("new.owner", "new_owner");
    model.create_team(TeamData::new("new").owner("new.owner"));
    model.create_repo(RepoData::new("myrepo").owned_by("new"));

    let plan = model.plan(&config(), &RemoteSnapshot::default());

    let last_user = plan
        .iter()
        .rposition(|m| matches!(m, Mutation::AddUserToOrg { .. }))
        .unwrap();
    let first_team = plan
        .iter()
        .position(|m| matches!(m, Mutation::CreateTeam { .. }))
        .unwrap();
    let first_repo = plan
        .iter()
        .position(|m| matches!(m, Mutation::CreateRepository { .. }))
        .unwrap();
    assert!(last_user < first_team);
    assert!(first_team < first_repo);
    // a freshly created team or repository never sees an edit in the same plan
    assert!(!plan.iter().any(|m| matches!(
        m,
        Mutation::UpdateTeamAddMember { .. } | Mutation::UpdateRepositoryAddTeamAccess { .. }
    )));
}

#[test]
fn changeset_cap_keeps_the_executor_untouched() {
    let config = v1::RepositoryConfig {
        max_changesets: 1,
        ..v1::RepositoryConfig::default()
    };
    let mut model = DataModel::default();
    model.create_user("new.owner", "new_owner");
    model.create_team(TeamData::new("new").owner("new.owner"));

    let recorder = Recorder::default();
    let err = model
        .reconcile(&config, &RemoteSnapshot::default(), &recorder)
        .unwrap_err();
    assert!(err.to_string().contains("max_changesets"));
    assert!(!*recorder.begun.borrow());
    assert!(recorder.teams_created.borrow().is_empty());
}

#[test]
fn executor_error_rolls_back() {
    let mut model = DataModel::default();
    model.create_user("new.owner", "new_owner");
    model.create_team(TeamData::new("new").owner("new.owner"));

    let recorder = Recorder {
        fail_on_create_team: Some("new".to_string()),
        ..Recorder::default()
    };
    let err = model
        .reconcile(&config(), &RemoteSnapshot::default(), &recorder)
        .unwrap_err();
    assert!(err.to_string().contains("cannot create team"));
    assert!(recorder.rolled_back.borrow().is_some());
    assert!(!*recorder.committed.borrow());
    // events before the failure were delivered
    assert_eq!(*recorder.users_created.borrow(), vec!["new_owner".to_string()]);
}

#[test]
fn cancelled_cycle_never_reaches_the_listener() {
    let mut model = DataModel::default();
    model.create_user("new.owner", "new_owner");
    model.create_team(TeamData::new("new").owner("new.owner"));

    let token = CancelToken::new();
    token.cancel();

    let config = config();
    let recorder = Recorder::default();
    let result = Reconciler::new(&config).reconcile(
        &token,
        &model.organization(),
        &RemoteSnapshot::default(),
        false,
        &recorder,
    );
    assert!(result.is_err());
    assert!(!*recorder.begun.borrow());
}

/// The declared permission set survives the trip through the team-repo
/// permission map and the snapshot pivot unchanged.
#[test]
fn permission_map_round_trips_through_the_snapshot() {
    let config = config();
    let reconciler = Reconciler::new(&config);
    let repo: v1::Repository = RepoData::new("myrepo")
        .owned_by("Ops Team")
        .writer("dev")
        .reader("qa")
        .build()
        .unwrap()
        .into();

    let expected = reconciler.expected_team_permissions(&repo);

    let mut snapshot = RemoteSnapshot::default();
    for (slug, permission) in &expected {
        snapshot.team_repos.entry(slug.clone()).or_default().insert(
            "myrepo".to_string(),
            GithubTeamRepo {
                name: "myrepo".to_string(),
                permission: *permission,
            },
        );
    }

    let observed: BTreeMap<String, RepoPermission> = snapshot
        .repo_team_permissions("myrepo")
        .into_iter()
        .map(|(slug, permission)| (slug.to_string(), permission))
        .collect();
    assert_eq!(expected, observed);
}
