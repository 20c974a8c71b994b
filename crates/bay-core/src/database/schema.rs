// @generated manually to match the Ship/Session/ExecutionHistory data model.

diesel::table! {
    ships (id) {
        id -> Text,
        status -> Text,
        container_id -> Nullable<Text>,
        endpoint -> Nullable<Text>,
        driver -> Text,
        image -> Text,
        cpus -> Double,
        memory -> Text,
        disk -> Nullable<Text>,
        ttl_secs -> Integer,
        warm_pool -> Integer,
        created_at -> Text,
        updated_at -> Text,
        expires_at -> Nullable<Text>,
    }
}

diesel::table! {
    sessions (id) {
        id -> Text,
        ship_id -> Text,
        created_at -> Text,
        last_activity -> Text,
        expires_at -> Text,
        initial_ttl -> Integer,
    }
}

diesel::table! {
    execution_history (id) {
        id -> Text,
        session_id -> Text,
        ship_id -> Text,
        exec_type -> Text,
        code -> Text,
        success -> Integer,
        execution_time_ms -> Integer,
        output -> Nullable<Text>,
        error -> Nullable<Text>,
        description -> Nullable<Text>,
        tags -> Nullable<Text>,
        notes -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::joinable!(sessions -> ships (ship_id));
diesel::joinable!(execution_history -> sessions (session_id));

diesel::allow_tables_to_appear_in_same_query!(ships, sessions, execution_history,);
