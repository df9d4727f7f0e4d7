// ABOUTME: Renders the NFS node preparation script that stages ImageNet from blob storage
// ABOUTME: The script installs azcopy, downloads both archives, and extracts them in place

use std::path::Path;

use crate::config::secrets::PASSWORD_KEY;
use crate::config::ProjectSettings;

pub const NODEPREP_SCRIPT_NAME: &str = "nodeprep.sh";
pub const IMAGENET_DIR: &str = "/data/imagenet";
pub const DATASET_ARCHIVES: [&str; 2] = ["validation.tar.gz", "train.tar.gz"];

const AZCOPY_INSTALLER_URL: &str = concat!(
    "https://gist.githubusercontent.com/msalvaris/073c28a9993d58498957294d20d74202/raw/",
    "87a78275879f7c9bb8d6fb9de8a2d2996bb66c24/install_azcopy"
);

pub fn blob_url(settings: &ProjectSettings, archive: &str) -> String {
    format!(
        "https://{}.blob.core.windows.net/{}/{}",
        settings.storage_account_name, settings.container_name, archive
    )
}

pub fn nodeprep_script(settings: &ProjectSettings, storage_key: &str) -> String {
    let downloads: String = DATASET_ARCHIVES
        .iter()
        .map(|archive| {
            format!(
                "\nazcopy --source {url} \\\n        \
                 --destination {dir}/{archive} \\\n        \
                 --source-key {key} \\\n        \
                 --quiet\n",
                url = blob_url(settings, archive),
                dir = IMAGENET_DIR,
                archive = archive,
                key = storage_key,
            )
        })
        .collect();
    let extracts: String = DATASET_ARCHIVES
        .iter()
        .rev()
        .map(|archive| format!("tar -xzf {}\n", archive))
        .collect();

    format!(
        "#!/usr/bin/env bash\n\
         wget {installer}\n\
         chmod 777 install_azcopy\n\
         sudo ./install_azcopy\n\
         \n\
         mkdir -p {dir}\n\
         {downloads}\
         \n\
         cd {dir}\n\
         {extracts}",
        installer = AZCOPY_INSTALLER_URL,
        dir = IMAGENET_DIR,
        downloads = downloads,
        extracts = extracts,
    )
}

/// How to run the script on the file server. The cluster password is read back
/// from the env file and handed to `sshpass`.
pub fn remote_run_hint(
    settings: &ProjectSettings,
    env_path: &Path,
    file_server_ip: &str,
) -> String {
    format!(
        "export PASSWORD=\"$(batchai-horovod --env-file {env} config get {password_key})\"\n\
         sshpass -p \"$PASSWORD\" scp -o StrictHostKeyChecking=no {script} {target}:~/\n\
         sshpass -p \"$PASSWORD\" ssh -o StrictHostKeyChecking=no {target} \\\n    \
         \"sudo chmod 777 ~/{script} && ./{script}\"",
        env = env_path.display(),
        password_key = PASSWORD_KEY,
        script = NODEPREP_SCRIPT_NAME,
        target = format!("{}@{}", settings.username, file_server_ip),
    )
}
