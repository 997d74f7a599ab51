use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ListParams;
use kube_infra::{
    builder::ConfigMapBuilder,
    errors::{BuilderError, Verb},
    BuilderOption, ClusterClient, Error, MemoryClient, ObjectBuilder,
};
use std::{collections::BTreeMap, time::Duration};

fn config_map(name: &str, namespace: &str) -> ConfigMap {
    let mut cm = ConfigMap::default();
    cm.metadata.name = Some(name.to_string());
    cm.metadata.namespace = Some(namespace.to_string());
    cm
}

type Builder = ObjectBuilder<ConfigMap, MemoryClient>;

fn option(
    func: impl FnOnce(&mut Builder) -> anyhow::Result<()> + Send + 'static,
) -> BuilderOption<ConfigMap, MemoryClient> {
    Box::new(func)
}

fn data(key: &str, value: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from([(key.to_string(), value.to_string())]))
}

#[tokio::test]
async fn test_pull() {
    struct Case {
        name: &'static str,
        object: &'static str,
        namespace: &'static str,
        seeded: bool,
        expect: fn(&Result<Builder, Error>) -> bool,
    }
    let cases = [
        Case {
            name: "existing object",
            object: "cm",
            namespace: "ns",
            seeded: true,
            expect: |res| matches!(res, Ok(b) if b.object().is_some()),
        },
        Case {
            name: "missing object",
            object: "cm",
            namespace: "ns",
            seeded: false,
            expect: |res| matches!(res, Err(e) if e.is_not_found()),
        },
        Case {
            name: "empty name",
            object: "",
            namespace: "ns",
            seeded: true,
            expect: |res| matches!(res, Err(Error::Builder(BuilderError::NameEmpty))),
        },
        Case {
            name: "empty namespace",
            object: "cm",
            namespace: "",
            seeded: true,
            expect: |res| matches!(res, Err(Error::Builder(BuilderError::NamespaceEmpty))),
        },
    ];

    for case in cases {
        let client = MemoryClient::new();
        if case.seeded {
            client.seed(config_map("cm", "ns")).unwrap();
        }
        let res = ObjectBuilder::<ConfigMap, _>::pull(client, case.object, Some(case.namespace)).await;
        assert!((case.expect)(&res), "{}: got {:?}", case.name, res.err());
    }
}

#[tokio::test]
async fn create_is_idempotent() {
    let client = MemoryClient::new();
    let mut builder = ObjectBuilder::<ConfigMap, _>::namespaced(client.clone(), "cm", "ns");

    let uid = builder.create().await.unwrap().metadata.uid.clone();
    let again = builder.create().await.unwrap().metadata.uid.clone();

    assert!(uid.is_some());
    assert_eq!(uid, again);
    assert_eq!(client.count::<ConfigMap>(), 1);
}

#[tokio::test]
async fn generated_name_is_kept_after_create() {
    let client = MemoryClient::new();
    let mut cm = ConfigMap::default();
    cm.metadata.generate_name = Some("cm-".to_string());
    cm.metadata.namespace = Some("ns".to_string());
    let mut builder = ObjectBuilder::from_definition(client.clone(), cm);

    let uid = builder.create().await.unwrap().metadata.uid.clone();
    assert!(builder.name().starts_with("cm-"), "{}", builder.name());
    assert!(builder.exists().await);

    let again = builder.create().await.unwrap().metadata.uid.clone();
    assert_eq!(uid, again);
    assert_eq!(client.count::<ConfigMap>(), 1);

    builder.delete().await.unwrap();
    assert_eq!(client.count::<ConfigMap>(), 0);
}

#[tokio::test]
async fn invalid_builder_never_reaches_the_cluster() {
    let client = MemoryClient::new();
    let mut builder = ObjectBuilder::<ConfigMap, _>::namespaced(client.clone(), "cm", "ns");
    builder.with_label("", "value");

    assert!(!builder.exists().await);
    assert!(builder.create().await.unwrap_err().is_invalid_builder());
    assert!(builder.update(true).await.unwrap_err().is_invalid_builder());
    assert!(builder.delete().await.unwrap_err().is_invalid_builder());
    assert!(builder.get().await.unwrap_err().is_invalid_builder());
    assert_eq!(client.count::<ConfigMap>(), 0);
}

#[tokio::test]
async fn test_update() {
    struct Case {
        name: &'static str,
        exists: bool,
        force: bool,
        fail: &'static [Verb],
        expect_err_verb: Option<Verb>,
        expect_data: bool,
    }
    let cases = [
        Case {
            name: "update existing",
            exists: true,
            force: false,
            fail: &[],
            expect_err_verb: None,
            expect_data: true,
        },
        Case {
            name: "update missing",
            exists: false,
            force: false,
            fail: &[],
            expect_err_verb: Some(Verb::Update),
            expect_data: false,
        },
        Case {
            name: "failed update without force",
            exists: true,
            force: false,
            fail: &[Verb::Update],
            expect_err_verb: Some(Verb::Update),
            expect_data: false,
        },
        Case {
            name: "failed update with force recreates",
            exists: true,
            force: true,
            fail: &[Verb::Update],
            expect_err_verb: None,
            expect_data: true,
        },
        Case {
            name: "forced update with failing delete",
            exists: true,
            force: true,
            fail: &[Verb::Update, Verb::Delete],
            expect_err_verb: Some(Verb::Delete),
            expect_data: false,
        },
        Case {
            name: "forced update with failing create",
            exists: true,
            force: true,
            fail: &[Verb::Update, Verb::Create],
            expect_err_verb: Some(Verb::Create),
            expect_data: false,
        },
    ];

    for case in cases {
        let client = MemoryClient::new();
        let original_uid = match case.exists {
            true => client.seed(config_map("cm", "ns")).unwrap().metadata.uid,
            false => None,
        };
        let mut builder = ObjectBuilder::<ConfigMap, _>::namespaced(client.clone(), "cm", "ns");
        builder.with_poll_interval(Duration::from_millis(10));
        builder.definition_mut().data = data("key", "value");
        for verb in case.fail {
            client.fail_on(*verb);
        }

        let res = builder.update(case.force).await.map(|cm| cm.clone());
        client.clear_failures();

        match case.expect_err_verb {
            Some(verb) => {
                let err = res.unwrap_err();
                assert_eq!(err.verb(), Some(verb), "{}: {}", case.name, err);
            }
            None => {
                res.unwrap_or_else(|err| panic!("{}: {}", case.name, err));
            }
        }

        let stored = client.get::<ConfigMap>(Some("ns"), "cm").await.ok();
        let has_data = stored.as_ref().map_or(false, |cm| cm.data.is_some());
        assert_eq!(has_data, case.expect_data, "{}", case.name);

        if case.force && case.expect_err_verb.is_none() {
            let new_uid = stored.and_then(|cm| cm.metadata.uid);
            assert_ne!(new_uid, original_uid, "{}: object should be recreated", case.name);
        }
    }
}

#[tokio::test]
async fn update_with_stale_definition_uses_current_version() {
    let client = MemoryClient::new();
    let mut first = ObjectBuilder::<ConfigMap, _>::namespaced(client.clone(), "cm", "ns");
    first.create().await.unwrap();

    let mut second = ObjectBuilder::<ConfigMap, _>::pull(client.clone(), "cm", Some("ns"))
        .await
        .unwrap();
    second.definition_mut().data = data("owner", "second");
    second.update(false).await.unwrap();

    first.definition_mut().data = data("owner", "first");
    first.update(false).await.unwrap();

    let stored = client.get::<ConfigMap>(Some("ns"), "cm").await.unwrap();
    assert_eq!(stored.data.unwrap()["owner"], "first");
}

#[tokio::test]
async fn test_with_options() {
    let client = MemoryClient::new();
    let cases: Vec<(&str, Vec<BuilderOption<ConfigMap, MemoryClient>>, Option<&str>)> = vec![
        (
            "valid options apply in order",
            vec![
                option(|b| {
                    b.with_label("tier", "one");
                    Ok(())
                }),
                option(|b| {
                    b.with_label("tier", "two");
                    Ok(())
                }),
            ],
            None,
        ),
        (
            "failing option is recorded",
            vec![
                option(|_| anyhow::bail!("bad option")),
                option(|b| {
                    b.with_label("never", "set");
                    Ok(())
                }),
            ],
            Some("invalid builder: builder option failed: bad option"),
        ),
    ];

    for (name, options, expected_err) in cases {
        let mut builder = ObjectBuilder::<ConfigMap, _>::namespaced(client.clone(), "cm", "ns");
        builder.with_options(options);

        match expected_err {
            None => {
                builder.validate().unwrap();
                let labels = builder.definition().metadata.labels.clone().unwrap();
                assert_eq!(labels["tier"], "two", "{}", name);
            }
            Some(message) => {
                assert_eq!(builder.validate().unwrap_err().to_string(), message, "{}", name);
                assert!(builder.definition().metadata.labels.is_none(), "{}", name);
            }
        }
    }
}

#[tokio::test]
async fn options_are_skipped_on_invalid_builder() {
    let mut builder = ObjectBuilder::<ConfigMap, _>::namespaced(MemoryClient::new(), "", "ns");
    builder.with_options(vec![option(|_| anyhow::bail!("should not run"))]);

    let err = builder.validate().unwrap_err();
    assert!(matches!(err, Error::Builder(BuilderError::NameEmpty)), "{}", err);
}

#[tokio::test]
async fn list_wraps_every_object() {
    let client = MemoryClient::new();
    for (name, namespace) in [("a", "one"), ("b", "one"), ("c", "two")] {
        client.seed(config_map(name, namespace)).unwrap();
    }

    let all = ObjectBuilder::<ConfigMap, _>::list(client.clone(), None, &ListParams::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|b| b.is_valid() && b.object().is_some()));

    let one = ObjectBuilder::<ConfigMap, _>::list(client.clone(), Some("one"), &ListParams::default())
        .await
        .unwrap();
    let names: Vec<&str> = one.iter().map(|b| b.name()).collect();
    assert_eq!(names, vec!["a", "b"]);

    client.fail_on(Verb::List);
    let err = ObjectBuilder::<ConfigMap, _>::list(client, None, &ListParams::default())
        .await
        .err()
        .unwrap();
    assert_eq!(err.verb(), Some(Verb::List));
}

#[tokio::test]
async fn object_deleted_after_one_interval() {
    let client = MemoryClient::new();
    let interval = Duration::from_millis(100);
    let mut builder = ConfigMapBuilder::new(client.clone(), "cm", "ns");
    builder.with_poll_interval(interval);
    builder.create().await.unwrap();

    let deleter = {
        let client = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            client.delete::<ConfigMap>(Some("ns"), "cm").await.unwrap();
        })
    };

    let started = std::time::Instant::now();
    builder.wait_until_deleted(Duration::from_secs(5)).await.unwrap();
    let elapsed = started.elapsed();
    deleter.await.unwrap();

    // first check sees the object, the second one finds it gone
    assert!(elapsed >= interval, "finished too early: {:?}", elapsed);
    assert!(elapsed < interval * 5, "finished too late: {:?}", elapsed);
}

#[tokio::test]
async fn deletion_wait_times_out() {
    let client = MemoryClient::new();
    let mut builder = ConfigMapBuilder::new(client.clone(), "cm", "ns");
    builder.with_poll_interval(Duration::from_millis(10));
    builder.create().await.unwrap();

    let err = builder
        .wait_until_deleted(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_deadline_exceeded(), "{}", err);
    assert!(err.to_string().contains("deadline exceeded"));
}

#[tokio::test]
async fn delete_and_wait_removes_object() {
    let client = MemoryClient::new();
    let mut builder = ConfigMapBuilder::new(client.clone(), "cm", "ns");
    builder.with_poll_interval(Duration::from_millis(10));
    builder.create().await.unwrap();

    builder.delete_and_wait(Duration::from_secs(1)).await.unwrap();
    assert!(builder.object().is_none());
    assert!(!builder.exists().await);
    assert_eq!(client.count::<ConfigMap>(), 0);
}
