// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use petrel_db::DatabaseConfig;
use petrel_resources::{
    BitEnum, ListChange, PropDataType, PropTypeFlag, PropValue, ResourceError, ResourceEvent,
    ResourceListPredicate, ResourceSource, ResourceStore, ResourceTypeFlag, UpdateListener,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use test_case::test_case;

fn open_store() -> (TempDir, Arc<ResourceStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = ResourceStore::open(dir.path(), DatabaseConfig::default()).unwrap();
    (dir, store)
}

fn mail_schema(store: &ResourceStore) {
    store.resource_types().register("Email", BitEnum::new()).unwrap();
    store.resource_types().register("Contact", BitEnum::new()).unwrap();
    let props = store.prop_types();
    props.register("Subject", PropDataType::String, BitEnum::new(), "mail").unwrap();
    props.register("Size", PropDataType::Int, BitEnum::new(), "mail").unwrap();
    props.register("Date", PropDataType::DateTime, BitEnum::new(), "mail").unwrap();
    props.register("Unread", PropDataType::Bool, BitEnum::new(), "mail").unwrap();
    props.register("Labels", PropDataType::StringList, BitEnum::new(), "mail").unwrap();
    props
        .register("From", PropDataType::Link, BitEnum::new_with(PropTypeFlag::DirectedLink), "mail")
        .unwrap();
    props.register("Related", PropDataType::Link, BitEnum::new(), "mail").unwrap();
}

fn email(store: &ResourceStore, subject: &str, size: i32) -> i32 {
    let mut editor = store.create_resource("Email").unwrap();
    editor.set_prop("Subject", subject).unwrap();
    editor.set_prop("Size", size).unwrap();
    editor.commit().unwrap()
}

#[derive(Default)]
struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl UpdateListener for Recorder {
    fn resource_saved(&self, event: &ResourceEvent<'_>) -> Result<(), ResourceError> {
        let mut props: Vec<i32> = event.changes.changed_props().collect();
        props.sort_unstable();
        self.log
            .lock()
            .unwrap()
            .push(format!("{} saved {} {:?}", self.name, event.resource, props));
        Ok(())
    }

    fn resource_deleting(&self, resource: i32, _resource_type: i32) -> Result<(), ResourceError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} deleting {}", self.name, resource));
        Ok(())
    }
}

#[test]
fn registration_is_idempotent() {
    let (_dir, store) = open_store();
    let props = store.prop_types();
    let before = props.all().len();
    let first = props.register("Subject", PropDataType::String, BitEnum::new(), "mail").unwrap();
    let again = props
        .register("Subject", PropDataType::String, BitEnum::new_with(PropTypeFlag::Internal), "mail")
        .unwrap();
    assert_eq!(first, again);
    assert_eq!(props.all().len(), before + 1);
    assert!(props.by_name("Subject").unwrap().flags.contains(PropTypeFlag::Internal));

    let types = store.resource_types();
    let email = types.register("Email", BitEnum::new()).unwrap();
    assert_eq!(types.register("Email", BitEnum::new_with(ResourceTypeFlag::NoIndex)).unwrap(), email);
    assert!(types.get(email).unwrap().flags.contains(ResourceTypeFlag::NoIndex));
}

#[test]
fn registration_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (subject, email) = {
        let store = ResourceStore::open(dir.path(), DatabaseConfig::default()).unwrap();
        mail_schema(&store);
        let subject = store.prop_types().id_of("Subject").unwrap();
        let email = store.resource_types().id_of("Email").unwrap();
        store.close().unwrap();
        (subject, email)
    };
    let store = ResourceStore::open(dir.path(), DatabaseConfig::default()).unwrap();
    assert_eq!(store.prop_types().id_of("Subject").unwrap(), subject);
    assert_eq!(store.resource_types().id_of("Email").unwrap(), email);
    assert!(store.prop_types().by_name("From").unwrap().is_directed_link());
}

#[test]
fn registering_another_data_type_is_refused() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let err = store
        .prop_types()
        .register("Subject", PropDataType::Int, BitEnum::new(), "mail")
        .unwrap_err();
    assert!(matches!(
        err,
        ResourceError::PropTypeMismatch {
            registered: PropDataType::String,
            requested: PropDataType::Int,
            ..
        }
    ));
}

#[test]
fn values_round_trip_through_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap().and_hms_opt(8, 30, 0).unwrap();
    let id = {
        let store = ResourceStore::open(dir.path(), DatabaseConfig::default()).unwrap();
        mail_schema(&store);
        let mut editor = store.create_resource("Email").unwrap();
        editor
            .set_prop("Subject", "quarterly report")
            .unwrap()
            .set_prop("Size", 4096)
            .unwrap()
            .set_prop("Date", date)
            .unwrap()
            .set_prop("Unread", true)
            .unwrap()
            .set_prop("Labels", vec!["work".to_string(), "finance".to_string()])
            .unwrap();
        let id = editor.commit().unwrap();
        store.close().unwrap();
        id
    };
    let store = ResourceStore::open(dir.path(), DatabaseConfig::default()).unwrap();
    assert_eq!(store.get_prop(id, "Subject").unwrap(), Some(PropValue::String("quarterly report".into())));
    assert_eq!(store.get_prop(id, "Size").unwrap(), Some(PropValue::Int(4096)));
    assert_eq!(store.get_prop(id, "Date").unwrap(), Some(PropValue::DateTime(date)));
    assert_eq!(store.get_prop(id, "Unread").unwrap(), Some(PropValue::Bool(true)));
    assert_eq!(
        store.get_prop(id, "Labels").unwrap(),
        Some(PropValue::StringList(vec!["work".into(), "finance".into()]))
    );

    let date_prop = store.prop_types().id_of("Date").unwrap();
    assert_eq!(store.find_with_value(date_prop, &PropValue::DateTime(date)).unwrap(), vec![id]);
    let labels = store.prop_types().id_of("Labels").unwrap();
    assert_eq!(store.find_with_value(labels, &"finance".into()).unwrap(), vec![id]);
}

#[test]
fn wrong_value_type_is_refused() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let mut editor = store.create_resource("Email").unwrap();
    assert!(matches!(
        editor.set_prop("Size", "large"),
        Err(ResourceError::WrongValueType { expected: PropDataType::Int, actual: PropDataType::String, .. })
    ));
    assert!(matches!(editor.add_link("Subject", 1), Err(ResourceError::NotALink(_))));
}

#[test]
fn string_values_become_string_lists() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let id = email(&store, "hello", 1);
    store
        .prop_types()
        .register_forced("Subject", PropDataType::StringList, BitEnum::new(), "mail")
        .unwrap();
    assert_eq!(
        store.get_prop(id, "Subject").unwrap(),
        Some(PropValue::StringList(vec!["hello".into()]))
    );
}

#[test_case(PropDataType::Bool, true ; "int to bool keeps values")]
#[test_case(PropDataType::Double, false ; "int to double with values is refused")]
fn forcing_int_type(to: PropDataType, allowed: bool) {
    let (_dir, store) = open_store();
    mail_schema(&store);
    email(&store, "sized", 1);
    let result = store.prop_types().register_forced("Size", to, BitEnum::new(), "mail");
    assert_eq!(result.is_ok(), allowed);
    if !allowed {
        assert!(matches!(result, Err(ResourceError::ForcedTypeNotAllowed { .. })));
    }
}

#[test]
fn forcing_unused_type_is_allowed() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    store
        .prop_types()
        .register_forced("Size", PropDataType::Double, BitEnum::new(), "mail")
        .unwrap();
    assert_eq!(store.prop_types().by_name("Size").unwrap().data_type, PropDataType::Double);
}

#[test]
fn display_names_follow_link_direction() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let props = store.prop_types();
    assert!(matches!(
        props.set_display_names("From", "From", None),
        Err(ResourceError::DisplayNameMismatch { expected: 2, .. })
    ));
    assert!(matches!(
        props.set_display_names("Subject", "Subject", Some("Subject of")),
        Err(ResourceError::DisplayNameMismatch { expected: 1, .. })
    ));
    props.set_display_names("From", "From", Some("Sender of")).unwrap();
    let from = props.by_name("From").unwrap();
    assert_eq!(from.display_name_for(from.id), "From");
    assert_eq!(from.display_name_for(-from.id), "Sender of");
}

#[test]
fn deleting_a_prop_type_removes_its_data() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let a = email(&store, "a", 1);
    let b = email(&store, "b", 2);
    let mut editor = store.edit(a).unwrap();
    editor.add_link("Related", b).unwrap();
    editor.commit().unwrap();
    store.set_link_restriction("Email", "Related", 0, Some(3)).unwrap();

    let related = store.prop_types().id_of("Related").unwrap();
    let backing = store.prop_types().get(related).unwrap().resource;
    let count = store.count_resources().unwrap();
    store.prop_types().delete(related).unwrap();

    assert!(store.prop_types().by_name("Related").is_none());
    assert_eq!(store.resource_type(backing).unwrap(), None);
    assert_eq!(store.count_resources().unwrap(), count - 1);
    let email_type = store.resource_types().id_of("Email").unwrap();
    assert!(store.link_restrictions(email_type).unwrap().is_empty());

    let size = store.prop_types().id_of("Size").unwrap();
    store.prop_types().delete(size).unwrap();
    assert!(matches!(store.get_prop(a, "Size"), Err(ResourceError::UnknownPropType(_))));
    assert_eq!(store.get_prop(b, "Subject").unwrap(), Some(PropValue::String("b".into())));
}

#[test]
fn undirected_links_are_symmetric() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let a = email(&store, "a", 1);
    let b = email(&store, "b", 2);
    let mut editor = store.edit(a).unwrap();
    editor.add_link("Related", b).unwrap();
    editor.commit().unwrap();
    assert_eq!(store.get_links(a, "Related").unwrap(), vec![b]);
    assert_eq!(store.get_links(b, "Related").unwrap(), vec![a]);

    let mut editor = store.edit(b).unwrap();
    editor.delete_link("Related", a).unwrap();
    editor.commit().unwrap();
    assert!(store.get_links(a, "Related").unwrap().is_empty());
}

#[test]
fn linking_to_missing_resource_fails() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let a = email(&store, "a", 1);
    let mut editor = store.edit(a).unwrap();
    editor.add_link("Related", 9999).unwrap();
    assert!(matches!(editor.commit(), Err(ResourceError::ResourceDeleted(9999))));
}

#[test]
fn listeners_hear_saves_and_deletes_in_order() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let log = Arc::new(Mutex::new(vec![]));
    let normal = store.subscribe(
        Arc::new(Recorder { name: "normal", log: log.clone() }),
        None,
        false,
    );
    let _priority = store.subscribe(
        Arc::new(Recorder { name: "priority", log: log.clone() }),
        None,
        true,
    );
    let contact = store.create_resource("Contact").unwrap().commit().unwrap();
    log.lock().unwrap().clear();

    let from = store.prop_types().id_of("From").unwrap();
    let mut editor = store.create_resource("Email").unwrap();
    editor.add_link("From", contact).unwrap();
    let mail = editor.commit().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            format!("priority saved {mail} [{from}]"),
            format!("normal saved {mail} [{from}]"),
            format!("priority saved {contact} [{}]", -from),
            format!("normal saved {contact} [{}]", -from),
        ]
    );

    log.lock().unwrap().clear();
    store.unsubscribe(normal);
    store.delete_resource(mail).unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            format!("priority deleting {mail}"),
            format!("priority saved {contact} [{}]", -from),
        ]
    );
    assert!(store.get_back_links(contact, "From").unwrap().is_empty());
}

#[test]
fn unchanged_values_do_not_notify() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let id = email(&store, "same", 1);
    let log = Arc::new(Mutex::new(vec![]));
    let _sub = store.subscribe(Arc::new(Recorder { name: "l", log: log.clone() }), None, false);
    let mut editor = store.edit(id).unwrap();
    editor.set_prop("Subject", "same").unwrap();
    editor.commit().unwrap();
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn live_list_tracks_store_changes() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let email_type = store.resource_types().id_of("Email").unwrap();
    let unread = store.prop_types().id_of("Unread").unwrap();
    let a = email(&store, "a", 1);

    let list = store
        .live_list(ResourceListPredicate::Intersection(vec![
            ResourceListPredicate::OfType(email_type),
            ResourceListPredicate::PropEquals { prop: unread, value: PropValue::Bool(true) },
        ]))
        .unwrap();
    assert!(list.is_empty());
    let seen = Arc::new(Mutex::new(vec![]));
    let sink = seen.clone();
    list.on_change(move |c| sink.lock().unwrap().push(c));

    let mut editor = store.edit(a).unwrap();
    editor.set_prop("Unread", true).unwrap();
    editor.commit().unwrap();
    let b = email(&store, "b", 2);
    let mut editor = store.edit(b).unwrap();
    editor.set_prop("Unread", true).unwrap();
    editor.commit().unwrap();
    assert_eq!(list.ids(), vec![a, b]);

    let mut editor = store.edit(a).unwrap();
    editor.set_prop("Unread", false).unwrap();
    editor.commit().unwrap();
    store.delete_resource(b).unwrap();
    assert!(list.is_empty());
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ListChange::Added(a),
            ListChange::Added(b),
            ListChange::Removed(a),
            ListChange::Removed(b),
        ]
    );
}

#[test]
fn union_keeps_member_still_matched_by_other_branch() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let size = store.prop_types().id_of("Size").unwrap();
    let unread = store.prop_types().id_of("Unread").unwrap();
    let id = email(&store, "both", 7);
    let mut editor = store.edit(id).unwrap();
    editor.set_prop("Unread", true).unwrap();
    editor.commit().unwrap();

    let list = store
        .live_list(ResourceListPredicate::Union(vec![
            ResourceListPredicate::PropEquals { prop: size, value: PropValue::Int(7) },
            ResourceListPredicate::HasProp(unread),
        ]))
        .unwrap();
    assert_eq!(list.ids(), vec![id]);

    let mut editor = store.edit(id).unwrap();
    editor.set_prop("Size", 8).unwrap();
    editor.commit().unwrap();
    assert!(list.contains(id));

    let mut editor = store.edit(id).unwrap();
    editor.delete_prop("Unread").unwrap();
    editor.commit().unwrap();
    assert!(!list.contains(id));
}

#[test]
fn type_change_moves_resource_between_lists() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    let email_type = store.resource_types().id_of("Email").unwrap();
    let contact_type = store.resource_types().id_of("Contact").unwrap();
    let id = email(&store, "x", 1);
    let emails = store.live_list(ResourceListPredicate::OfType(email_type)).unwrap();
    let contacts = store.live_list(ResourceListPredicate::OfType(contact_type)).unwrap();

    let mut editor = store.edit(id).unwrap();
    editor.set_type("Contact").unwrap();
    editor.commit().unwrap();
    assert!(!emails.contains(id));
    assert!(contacts.contains(id));
}

#[test]
fn link_restrictions_report_violations() {
    let (_dir, store) = open_store();
    mail_schema(&store);
    store.set_link_restriction("Email", "From", 1, Some(1)).unwrap();
    let a = store.create_resource("Contact").unwrap().commit().unwrap();
    let b = store.create_resource("Contact").unwrap().commit().unwrap();
    let mail = email(&store, "m", 1);

    let violations = store.check_link_restrictions(mail).unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].count, 0);

    let mut editor = store.edit(mail).unwrap();
    editor.add_link("From", a).unwrap();
    editor.commit().unwrap();
    assert!(store.check_link_restrictions(mail).unwrap().is_empty());

    let mut editor = store.edit(mail).unwrap();
    editor.add_link("From", b).unwrap();
    editor.commit().unwrap();
    assert_eq!(store.check_link_restrictions(mail).unwrap()[0].count, 2);

    store.delete_link_restriction("Email", "From").unwrap();
    assert!(store.check_link_restrictions(mail).unwrap().is_empty());
}
